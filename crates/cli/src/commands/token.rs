//! Token Commands

use anyhow::{Context as _, Result};
use clap::Subcommand;
use colored::Colorize;
use hubspoke_common::{Credential, WgKeyPair};
use serde::Serialize;
use uuid::Uuid;

use crate::context::Context;
use crate::output::{self, print_item, print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a single-use token for one spoke
    Issue {
        /// Spoke label
        label: String,

        /// Reserve a specific tunnel address instead of the next free one
        #[arg(long)]
        address: Option<String>,
    },

    /// Issue a group token several hosts can enroll with
    IssueGroup {
        /// Group name; enrolled spokes are named <group>-<hostname>
        name: String,

        /// Maximum number of enrollments (unlimited when omitted)
        #[arg(long)]
        max_uses: Option<u32>,
    },

    /// List tokens
    List,

    /// Show one token
    Show {
        /// Token ID
        id: Uuid,
    },

    /// Check a token secret without consuming it
    Validate {
        /// Token secret
        secret: String,
    },

    /// Revoke a token that has not been used
    Revoke {
        /// Token ID
        id: Uuid,
    },

    /// Remove expired, unused tokens
    Sweep,

    /// Render the spoke-side WireGuard config for a token
    Config {
        /// Token ID
        id: Uuid,

        /// Spoke private key; a fresh key pair is generated when omitted
        #[arg(long, env = "HUBSPOKE_SPOKE_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },
}

#[derive(Serialize)]
pub struct TokenDisplay {
    pub id: Uuid,
    pub label: String,
    pub kind: String,
    pub address: String,
    pub uses: String,
    pub state: String,
    pub expires_at: String,
}

impl From<&Credential> for TokenDisplay {
    fn from(c: &Credential) -> Self {
        let now = chrono::Utc::now();
        let (kind, uses, exhausted) = match &c.group {
            Some(g) => (
                "group",
                match g.max_uses {
                    Some(max) => format!("{}/{}", g.use_count, max),
                    None => format!("{}/∞", g.use_count),
                },
                g.exhausted(),
            ),
            None => ("single", if c.consumed { "1/1" } else { "0/1" }.to_string(), c.consumed),
        };
        let state = if exhausted {
            "used"
        } else if c.is_expired(now) {
            "expired"
        } else {
            "valid"
        };

        Self {
            id: c.id,
            label: c.spoke_label.clone(),
            kind: kind.to_string(),
            address: c
                .allocated
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            uses,
            state: state.to_string(),
            expires_at: output::timestamp(Some(c.expires_at)),
        }
    }
}

impl TableDisplay for TokenDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Label", "Kind", "Address", "Uses", "State", "Expires"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            output::short_id(&self.id),
            self.label.clone(),
            self.kind.clone(),
            self.address.clone(),
            self.uses.clone(),
            self.state.clone(),
            self.expires_at.clone(),
        ]
    }
}

/// Newly issued token, the only time the secret is shown
#[derive(Serialize)]
struct Issued<'a> {
    #[serde(flatten)]
    token: TokenDisplay,
    secret: &'a str,
}

fn print_issued(credential: &Credential, format: OutputFormat) {
    let token = TokenDisplay::from(credential);
    if format == OutputFormat::Json {
        output::print_value(
            &Issued {
                token,
                secret: &credential.secret,
            },
            "",
            format,
        );
        return;
    }
    print_success(&format!("Issued token {} for {}", credential.id, credential.spoke_label));
    print_item(&token, format);
    println!("{} {}", "Secret:".bold(), credential.secret.cyan());
    print_warning("The secret is shown once; hand it to the spoke now");
}

pub async fn execute(cmd: TokenCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        TokenCommands::Issue { label, address } => {
            let credential = ctx.service.issue_credential(&label, address.as_deref())?;
            print_issued(&credential, format);
        }

        TokenCommands::IssueGroup { name, max_uses } => {
            let credential = ctx.service.issue_group_credential(&name, max_uses)?;
            print_issued(&credential, format);
        }

        TokenCommands::List => {
            let tokens: Vec<TokenDisplay> = ctx
                .service
                .list_credentials()?
                .iter()
                .map(TokenDisplay::from)
                .collect();
            print_list(&tokens, format);
        }

        TokenCommands::Show { id } => {
            let credential = ctx.service.credential(id)?;
            print_item(&TokenDisplay::from(&credential), format);
        }

        TokenCommands::Validate { secret } => {
            let credential = ctx.service.validate_credential(&secret)?;
            if format != OutputFormat::Json {
                print_success("Token is valid");
            }
            print_item(&TokenDisplay::from(&credential), format);
        }

        TokenCommands::Revoke { id } => {
            if ctx.service.revoke_credential(id)? {
                print_success(&format!("Revoked token {}", id));
            } else {
                // Distinguish a missing token from one already in use
                ctx.service.credential(id)?;
                print_warning(&format!("Token {} has been used and cannot be revoked", id));
            }
        }

        TokenCommands::Sweep => {
            let removed = ctx.service.sweep_expired()?;
            output::print_value(
                &serde_json::json!({ "removed": removed }),
                &format!("Removed {} expired tokens", removed),
                format,
            );
        }

        TokenCommands::Config { id, private_key } => {
            let private_key = match private_key {
                Some(key) => WgKeyPair::from_private(&key)
                    .context("Invalid spoke private key")?
                    .private_key,
                None => {
                    let pair = WgKeyPair::generate();
                    eprintln!("{} {}", "Spoke public key:".bold(), pair.public_key);
                    pair.private_key
                }
            };
            let config = ctx.service.spoke_config(id, &private_key)?;
            output::print_value(&serde_json::json!({ "config": config }), config.trim_end(), format);
        }
    }

    Ok(())
}
