//! Spoke Commands

use anyhow::{Context as _, Result};
use clap::Subcommand;
use hubspoke_common::{EnrollmentRequest, Platform, SpokeView};
use serde::Serialize;
use uuid::Uuid;

use crate::context::Context;
use crate::output::{self, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum SpokeCommands {
    /// Enroll a spoke with a token and add its peer to the hub
    Register {
        /// Token secret
        #[arg(long, env = "HUBSPOKE_TOKEN", hide_env_values = true)]
        token: String,

        /// Spoke WireGuard public key
        #[arg(long)]
        public_key: String,

        /// Spoke platform (linux, macos, windows, proxmox)
        #[arg(long, default_value = "linux")]
        platform: Platform,

        /// Hostname (required for group tokens)
        #[arg(long)]
        hostname: Option<String>,

        /// Stable machine identifier
        #[arg(long)]
        machine_id: Option<String>,

        /// Address of the spoke on its local network
        #[arg(long)]
        local_ip: Option<String>,

        /// Cluster to place the spoke in
        #[arg(long)]
        cluster: Option<String>,

        /// Free-form JSON metadata
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List spokes with live status
    List,

    /// Show one spoke
    Show {
        /// Spoke ID
        id: Uuid,
    },

    /// Remove a spoke and its peer
    Remove {
        /// Spoke ID
        id: Uuid,
    },
}

#[derive(Serialize)]
pub struct SpokeDisplay {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub platform: String,
    pub status: String,
    pub applied: String,
    pub endpoint: String,
    pub last_handshake: String,
    pub transfer: String,
}

impl From<&SpokeView> for SpokeDisplay {
    fn from(view: &SpokeView) -> Self {
        let r = &view.registration;
        Self {
            id: r.id,
            name: r.name.clone(),
            address: r
                .allocated
                .iter()
                .map(|a| a.ip().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            platform: r.platform.to_string(),
            status: view.status.to_string(),
            applied: r.apply_state.to_string(),
            endpoint: view.endpoint.clone().unwrap_or_else(|| "-".to_string()),
            last_handshake: output::timestamp(view.last_handshake),
            transfer: format!(
                "{} / {}",
                output::bytes(view.rx_bytes),
                output::bytes(view.tx_bytes)
            ),
        }
    }
}

impl TableDisplay for SpokeDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "ID",
            "Name",
            "Address",
            "Platform",
            "Status",
            "Peer",
            "Endpoint",
            "Handshake",
            "Rx / Tx",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            output::short_id(&self.id),
            self.name.clone(),
            self.address.clone(),
            self.platform.clone(),
            self.status.clone(),
            self.applied.clone(),
            self.endpoint.clone(),
            self.last_handshake.clone(),
            self.transfer.clone(),
        ]
    }
}

fn parse_metadata(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        Some(text) => serde_json::from_str(text).context("--metadata must be valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

pub async fn execute(cmd: SpokeCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        SpokeCommands::Register {
            token,
            public_key,
            platform,
            hostname,
            machine_id,
            local_ip,
            cluster,
            metadata,
        } => {
            let request = EnrollmentRequest {
                secret: token,
                public_key,
                platform,
                hostname,
                machine_id,
                local_ip,
                cluster_name: cluster,
                metadata: parse_metadata(metadata.as_deref())?,
            };
            let enrollment = ctx.service.register_spoke(request).await?;
            let r = &enrollment.registration;
            if format != OutputFormat::Json {
                print_success(&format!("Registered {} ({})", r.name, r.id));
            }
            let view = ctx.service.spoke(r.id).await?;
            print_item(&SpokeDisplay::from(&view), format);
        }

        SpokeCommands::List => {
            let spokes: Vec<SpokeDisplay> = ctx
                .service
                .list_spokes()
                .await?
                .iter()
                .map(SpokeDisplay::from)
                .collect();
            print_list(&spokes, format);
        }

        SpokeCommands::Show { id } => {
            let view = ctx.service.spoke(id).await?;
            if format == OutputFormat::Json {
                output::print_value(&view, "", format);
            } else {
                print_item(&SpokeDisplay::from(&view), format);
            }
        }

        SpokeCommands::Remove { id } => {
            let removed = ctx.service.remove_spoke(id).await?;
            print_success(&format!("Removed spoke {} ({})", removed.name, removed.id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        assert_eq!(parse_metadata(None).unwrap(), serde_json::Value::Null);
        let value = parse_metadata(Some(r#"{"rack":"b2"}"#)).unwrap();
        assert_eq!(value["rack"], "b2");
        assert!(parse_metadata(Some("rack=b2")).is_err());
    }
}
