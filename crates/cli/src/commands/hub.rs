//! Hub Commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use hubspoke_common::wireguard::InterfaceStatus;
use hubspoke_common::{HubInitConfig, HubInterface, HubUpdate};
use serde::Serialize;

use crate::context::Context;
use crate::output::{self, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum HubCommands {
    /// Initialize the hub: generate keys and bring the interface up
    Init {
        /// Tunnel network in CIDR notation (e.g., 10.8.0.0/24)
        #[arg(long)]
        cidr: String,

        /// UDP listen port
        #[arg(long, default_value = "51820")]
        port: u16,

        /// Endpoint spokes dial from outside (host:port)
        #[arg(long)]
        public_endpoint: String,

        /// Endpoint spokes on the hub's LAN dial (host:port)
        #[arg(long)]
        private_endpoint: Option<String>,

        /// DNS servers pushed to spokes
        #[arg(long, value_delimiter = ',')]
        dns: Vec<String>,
    },

    /// Show the hub configuration
    Show,

    /// Update DNS or endpoints. Existing tokens keep their old values.
    Update {
        /// Replace the DNS server list
        #[arg(long, value_delimiter = ',')]
        dns: Option<Vec<String>>,

        /// New public endpoint
        #[arg(long)]
        public_endpoint: Option<String>,

        /// New private endpoint
        #[arg(long, conflicts_with = "clear_private_endpoint")]
        private_endpoint: Option<String>,

        /// Remove the private endpoint
        #[arg(long)]
        clear_private_endpoint: bool,
    },

    /// Show tool availability and live interface status
    Status,
}

#[derive(Serialize)]
pub struct HubDisplay {
    pub address: String,
    pub network: String,
    pub listen_port: u16,
    pub public_key: String,
    pub public_endpoint: String,
    pub private_endpoint: String,
    pub dns: String,
    pub updated_at: String,
}

impl From<&HubInterface> for HubDisplay {
    fn from(hub: &HubInterface) -> Self {
        Self {
            address: hub.interface_address.to_string(),
            network: hub.network_cidr.to_string(),
            listen_port: hub.listen_port,
            public_key: hub.public_key.clone(),
            public_endpoint: hub.public_endpoint.clone(),
            private_endpoint: hub.private_endpoint.clone().unwrap_or_else(|| "-".to_string()),
            dns: if hub.dns.is_empty() {
                "-".to_string()
            } else {
                hub.dns.join(", ")
            },
            updated_at: output::timestamp(Some(hub.updated_at)),
        }
    }
}

impl TableDisplay for HubDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "Address",
            "Network",
            "Port",
            "Public Key",
            "Public Endpoint",
            "Private Endpoint",
            "DNS",
            "Updated",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.address.clone(),
            self.network.clone(),
            self.listen_port.to_string(),
            self.public_key.clone(),
            self.public_endpoint.clone(),
            self.private_endpoint.clone(),
            self.dns.clone(),
            self.updated_at.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct PeerStatusDisplay {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub latest_handshake: String,
    pub rx: String,
    pub tx: String,
}

impl TableDisplay for PeerStatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Endpoint", "Allowed IPs", "Handshake", "Received", "Sent"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.endpoint.clone(),
            self.allowed_ips.clone(),
            self.latest_handshake.clone(),
            self.rx.clone(),
            self.tx.clone(),
        ]
    }
}

fn peer_rows(status: &InterfaceStatus) -> Vec<PeerStatusDisplay> {
    status
        .peers
        .iter()
        .map(|p| PeerStatusDisplay {
            public_key: p.public_key.clone(),
            endpoint: p.endpoint.clone().unwrap_or_else(|| "-".to_string()),
            allowed_ips: p.allowed_ips.join(", "),
            latest_handshake: output::timestamp(p.last_handshake),
            rx: output::bytes(p.rx_bytes),
            tx: output::bytes(p.tx_bytes),
        })
        .collect()
}

pub async fn execute(cmd: HubCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        HubCommands::Init {
            cidr,
            port,
            public_endpoint,
            private_endpoint,
            dns,
        } => {
            let hub = ctx
                .service
                .initialize(HubInitConfig {
                    network_cidr: cidr,
                    listen_port: port,
                    public_endpoint,
                    private_endpoint,
                    dns,
                })
                .await?;
            if format != OutputFormat::Json {
                print_success(&format!(
                    "Hub initialized on {} at {}",
                    ctx.settings.interface.name, hub.interface_address
                ));
            }
            print_item(&HubDisplay::from(&hub), format);
        }

        HubCommands::Show => {
            let hub = ctx.service.hub()?;
            print_item(&HubDisplay::from(&hub), format);
        }

        HubCommands::Update {
            dns,
            public_endpoint,
            private_endpoint,
            clear_private_endpoint,
        } => {
            let update = HubUpdate {
                dns,
                public_endpoint,
                private_endpoint: if clear_private_endpoint {
                    Some(None)
                } else {
                    private_endpoint.map(Some)
                },
            };
            let hub = ctx.service.update_hub(update)?;
            if format != OutputFormat::Json {
                print_success("Hub updated; tokens issued earlier keep their original settings");
            }
            print_item(&HubDisplay::from(&hub), format);
        }

        HubCommands::Status => {
            let probe = ctx.service.probe().await;
            let iface = &ctx.settings.interface.name;
            if format == OutputFormat::Json {
                let status = if probe.interface_exists {
                    Some(ctx.service.interface_status().await?)
                } else {
                    None
                };
                output::print_value(
                    &serde_json::json!({ "probe": probe, "status": status }),
                    "",
                    format,
                );
                return Ok(());
            }

            let mark = |ok: bool| if ok { "yes".green() } else { "no".red() };
            println!("{}", " Interface".bold());
            println!("  WireGuard tools: {}", mark(probe.installed));
            println!("  {} up:          {}", iface, mark(probe.interface_exists));
            if !probe.interface_exists {
                return Ok(());
            }

            let status = ctx.service.interface_status().await?;
            println!("  Public key:      {}", status.public_key);
            println!("  Listening port:  {}", status.listen_port);
            println!();
            print_list(&peer_rows(&status), format);
        }
    }

    Ok(())
}
