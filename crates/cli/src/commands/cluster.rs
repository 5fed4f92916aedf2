//! Cluster Commands

use anyhow::Result;
use clap::Subcommand;
use hubspoke_common::{ClusterUpdate, ClusterView};
use serde::Serialize;
use uuid::Uuid;

use crate::context::Context;
use crate::output::{self, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// List clusters and their member counts
    List,

    /// Show one cluster
    Show {
        /// Cluster ID
        id: Uuid,
    },

    /// Edit cluster metadata. Pass an empty value to clear a field.
    Update {
        /// Cluster ID
        id: Uuid,

        /// Datacenter or site name
        #[arg(long)]
        datacenter: Option<String>,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },

    /// Delete a cluster that has no spokes left
    Delete {
        /// Cluster ID
        id: Uuid,
    },
}

#[derive(Serialize)]
pub struct ClusterDisplay {
    pub id: Uuid,
    pub name: String,
    pub datacenter: String,
    pub description: String,
    pub spokes: usize,
    pub updated_at: String,
}

impl From<&ClusterView> for ClusterDisplay {
    fn from(view: &ClusterView) -> Self {
        let or_dash = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        Self {
            id: view.cluster.id,
            name: view.cluster.name.clone(),
            datacenter: or_dash(&view.cluster.datacenter),
            description: or_dash(&view.cluster.description),
            spokes: view.spoke_ids.len(),
            updated_at: output::timestamp(Some(view.cluster.updated_at)),
        }
    }
}

impl TableDisplay for ClusterDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Datacenter", "Description", "Spokes", "Updated"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            output::short_id(&self.id),
            self.name.clone(),
            self.datacenter.clone(),
            self.description.clone(),
            self.spokes.to_string(),
            self.updated_at.clone(),
        ]
    }
}

fn show(view: &ClusterView, format: OutputFormat) {
    if format == OutputFormat::Json {
        output::print_value(view, "", format);
        return;
    }
    print_item(&ClusterDisplay::from(view), format);
    for id in &view.spoke_ids {
        println!("  spoke {}", id);
    }
}

pub async fn execute(cmd: ClusterCommands, ctx: Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ClusterCommands::List => {
            let views = ctx.service.list_clusters()?;
            if format == OutputFormat::Json {
                output::print_value(&views, "", format);
            } else {
                let rows: Vec<ClusterDisplay> = views.iter().map(ClusterDisplay::from).collect();
                print_list(&rows, format);
            }
        }

        ClusterCommands::Show { id } => {
            show(&ctx.service.cluster(id)?, format);
        }

        ClusterCommands::Update {
            id,
            datacenter,
            description,
        } => {
            let cluster = ctx.service.update_cluster(
                id,
                ClusterUpdate {
                    datacenter,
                    description,
                },
            )?;
            if format != OutputFormat::Json {
                print_success(&format!("Updated cluster {}", cluster.name));
            }
            show(&ctx.service.cluster(id)?, format);
        }

        ClusterCommands::Delete { id } => {
            let deleted = ctx.service.delete_cluster(id)?;
            print_success(&format!("Deleted cluster {} ({})", deleted.name, deleted.id));
        }
    }

    Ok(())
}
