//! External command execution

use crate::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs OS tools on behalf of the reconciler
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally feeding `stdin`, and return stdout.
    ///
    /// A non-zero exit status or spawn failure is `Error::ExternalCommand`;
    /// exceeding the runner's timeout is `Error::CommandTimeout`.
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String>;
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `tokio::process` backed runner
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let command = command_line(program, args);
        debug!("Running {}", command);

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExternalCommand {
                command: command.clone(),
                detail: format!("failed to spawn: {}", e),
            })?;

        // Feeding stdin counts against the timeout; dropping the future kills the child
        let exchange = async {
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| Error::ExternalCommand {
                        command: command.clone(),
                        detail: format!("failed to write stdin: {}", e),
                    })?;
            }
            child.wait_with_output().await.map_err(|e| Error::ExternalCommand {
                command: command.clone(),
                detail: e.to_string(),
            })
        };
        let finished = tokio::time::timeout(self.timeout, exchange).await;
        let output = match finished {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::CommandTimeout {
                    command,
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(Error::ExternalCommand {
                command,
                detail: format!(
                    "exit status {}: {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Recording runner for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::{command_line, CommandRunner};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// One recorded invocation
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invocation {
        pub program: String,
        pub args: Vec<String>,
        pub stdin: Option<String>,
    }

    impl Invocation {
        pub fn line(&self) -> String {
            let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
            command_line(&self.program, &args)
        }
    }

    enum Script {
        Respond(String),
        Fail(String),
        Timeout,
    }

    #[derive(Default)]
    struct State {
        calls: Vec<Invocation>,
        scripts: Vec<(String, Script)>,
        synced: Vec<String>,
    }

    /// Records every command and answers from a script keyed by command-line
    /// prefix. Unscripted commands succeed with empty output. The contents of
    /// every file passed to `wg syncconf` are captured.
    #[derive(Clone, Default)]
    pub struct FakeRunner {
        state: Arc<Mutex<State>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands starting with `prefix` with `output`
        pub fn respond(&self, prefix: &str, output: &str) {
            self.script(prefix, Script::Respond(output.to_string()));
        }

        /// Fail commands starting with `prefix`
        pub fn fail(&self, prefix: &str, detail: &str) {
            self.script(prefix, Script::Fail(detail.to_string()));
        }

        /// Make commands starting with `prefix` time out
        pub fn hang(&self, prefix: &str) {
            self.script(prefix, Script::Timeout);
        }

        /// Drop any script registered for `prefix`
        pub fn clear(&self, prefix: &str) {
            self.state.lock().scripts.retain(|(p, _)| p != prefix);
        }

        fn script(&self, prefix: &str, script: Script) {
            let mut state = self.state.lock();
            state.scripts.retain(|(p, _)| p != prefix);
            state.scripts.push((prefix.to_string(), script));
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.state.lock().calls.clone()
        }

        /// Command lines of every recorded invocation
        pub fn lines(&self) -> Vec<String> {
            self.state.lock().calls.iter().map(Invocation::line).collect()
        }

        /// Number of recorded invocations starting with `prefix`
        pub fn count(&self, prefix: &str) -> usize {
            self.lines().iter().filter(|l| l.starts_with(prefix)).count()
        }

        /// Configurations applied through `wg syncconf`, oldest first
        pub fn synced(&self) -> Vec<String> {
            self.state.lock().synced.clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
            let line = command_line(program, args);
            let mut state = self.state.lock();
            state.calls.push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                stdin: stdin.map(str::to_string),
            });

            let outcome = state
                .scripts
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, script)| match script {
                    Script::Respond(out) => Ok(out.clone()),
                    Script::Fail(detail) => Err(Error::ExternalCommand {
                        command: line.clone(),
                        detail: detail.clone(),
                    }),
                    Script::Timeout => Err(Error::CommandTimeout {
                        command: line.clone(),
                        seconds: 10,
                    }),
                })
                .unwrap_or_else(|| Ok(String::new()));

            if outcome.is_ok() && program == "wg" && args.first() == Some(&"syncconf") {
                if let Some(path) = args.get(2) {
                    let applied = std::fs::read_to_string(path)?;
                    state.synced.push(applied);
                }
            }
            outcome
        }
    }
}
