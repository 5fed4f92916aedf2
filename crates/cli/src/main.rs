//! HubSpoke CLI - Main Entry Point
//!
//! Initializes the hub, issues installation tokens, enrolls spokes and
//! inspects the live interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::{cluster, hub, spoke, token};
use context::{Context, Overrides};

/// HubSpoke CLI - WireGuard hub provisioning
#[derive(Parser)]
#[command(name = "hubspoke")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file
    #[arg(long, env = "HUBSPOKE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(long, env = "HUBSPOKE_STORE", global = true)]
    store: Option<PathBuf>,

    /// WireGuard interface name
    #[arg(long, global = true)]
    interface: Option<String>,

    /// Lifetime of newly issued tokens, in hours
    #[arg(long, env = "HUBSPOKE_TOKEN_TTL_HOURS", global = true)]
    token_ttl_hours: Option<u32>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the hub interface
    #[command(subcommand)]
    Hub(hub::HubCommands),

    /// Manage installation tokens
    #[command(subcommand)]
    Token(token::TokenCommands),

    /// Manage spokes
    #[command(subcommand)]
    Spoke(spoke::SpokeCommands),

    /// Manage clusters
    #[command(subcommand)]
    Cluster(cluster::ClusterCommands),

    /// Run one convergence pass between the registry and the interface
    Converge,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format;
    if let Err(e) = run(cli).await {
        let public = match e.downcast_ref::<hubspoke_common::Error>() {
            Some(err) => {
                tracing::debug!("{:#}", e);
                err.to_public()
            }
            None => hubspoke_common::PublicError {
                code: "CLI_ERROR",
                kind: hubspoke_common::ErrorKind::Validation,
                message: format!("{:#}", e),
            },
        };
        output::print_failure(&public, format);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("HubSpoke CLI v{}", hubspoke_common::VERSION);
        return Ok(());
    }

    let ctx = Context::open(Overrides {
        config: cli.config,
        store: cli.store,
        interface: cli.interface,
        token_ttl_hours: cli.token_ttl_hours,
    })?;

    match cli.command {
        Commands::Hub(cmd) => hub::execute(cmd, ctx, cli.format).await?,
        Commands::Token(cmd) => token::execute(cmd, ctx, cli.format).await?,
        Commands::Spoke(cmd) => spoke::execute(cmd, ctx, cli.format).await?,
        Commands::Cluster(cmd) => cluster::execute(cmd, ctx, cli.format).await?,
        Commands::Converge => {
            let report = ctx.service.converge().await?;
            output::print_value(
                &report,
                &format!(
                    "{} in sync, {} added, {} removed, {} failed",
                    report.in_sync, report.added, report.removed, report.failed
                ),
                cli.format,
            );
        }
        Commands::Version => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_group_issue() {
        let cli = Cli::try_parse_from([
            "hubspoke",
            "--format",
            "json",
            "token",
            "issue-group",
            "pve",
            "--max-uses",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Token(token::TokenCommands::IssueGroup { name, max_uses }) => {
                assert_eq!(name, "pve");
                assert_eq!(max_uses, Some(3));
            }
            _ => panic!("wrong subcommand"),
        }
        assert_eq!(cli.format, output::OutputFormat::Json);
    }

    #[test]
    fn test_hub_update_private_endpoint_flags_conflict() {
        let result = Cli::try_parse_from([
            "hubspoke",
            "hub",
            "update",
            "--private-endpoint",
            "10.0.0.1:51820",
            "--clear-private-endpoint",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parses_cluster_update() {
        let id = uuid::Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from([
            "hubspoke",
            "cluster",
            "update",
            id.as_str(),
            "--datacenter",
            "fra1",
            "--description",
            "",
        ])
        .unwrap();
        match cli.command {
            Commands::Cluster(cluster::ClusterCommands::Update {
                datacenter,
                description,
                ..
            }) => {
                assert_eq!(datacenter.as_deref(), Some("fra1"));
                assert_eq!(description.as_deref(), Some(""));
            }
            _ => panic!("wrong subcommand"),
        }

        assert!(Cli::try_parse_from(["hubspoke", "cluster", "delete", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_dns_list_is_comma_delimited() {
        let cli = Cli::try_parse_from([
            "hubspoke",
            "hub",
            "init",
            "--cidr",
            "10.8.0.0/24",
            "--public-endpoint",
            "vpn.example.com:51820",
            "--dns",
            "1.1.1.1,9.9.9.9",
        ])
        .unwrap();
        match cli.command {
            Commands::Hub(hub::HubCommands::Init { dns, port, .. }) => {
                assert_eq!(dns, vec!["1.1.1.1", "9.9.9.9"]);
                assert_eq!(port, 51820);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
