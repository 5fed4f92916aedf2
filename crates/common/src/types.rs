//! Core types for HubSpoke

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handshake age below which a spoke counts as active
pub const ACTIVE_HANDSHAKE_SECS: i64 = 3 * 60;

/// Handshake age below which a spoke counts as idle rather than gone
pub const IDLE_HANDSHAKE_SECS: i64 = 10 * 60;

/// Spoke operating system, as reported by the installer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
    Proxmox,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Macos => write!(f, "macos"),
            Platform::Windows => write!(f, "windows"),
            Platform::Proxmox => write!(f, "proxmox"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Macos),
            "windows" => Ok(Self::Windows),
            "proxmox" => Ok(Self::Proxmox),
            _ => Err(format!("unknown platform: {}", s)),
        }
    }
}

/// Observed liveness of a spoke, derived from its latest handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpokeStatus {
    Pending,
    Active,
    Inactive,
}

impl Default for SpokeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SpokeStatus {
    /// Classify handshake freshness. No handshake yet means pending.
    pub fn from_handshake(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(last) = last else {
            return Self::Pending;
        };
        let age = (now - last).num_seconds();
        if age < ACTIVE_HANDSHAKE_SECS {
            Self::Active
        } else if age < IDLE_HANDSHAKE_SECS {
            Self::Pending
        } else {
            Self::Inactive
        }
    }
}

impl std::fmt::Display for SpokeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpokeStatus::Pending => write!(f, "pending"),
            SpokeStatus::Active => write!(f, "active"),
            SpokeStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Whether a registration's peer has been applied to the live interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    Provisioning,
    Applied,
    Failed,
}

impl std::fmt::Display for ApplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyState::Provisioning => write!(f, "provisioning"),
            ApplyState::Applied => write!(f, "applied"),
            ApplyState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ApplyState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown apply state: {}", s)),
        }
    }
}

/// The hub's tunnel interface (singleton)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubInterface {
    pub interface_address: Ipv4Network,
    pub listen_port: u16,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub public_key: String,
    pub network_cidr: Ipv4Network,
    pub public_endpoint: String,
    pub private_endpoint: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HubInterface {
    /// The hub binding copied into every credential at issue time
    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            interface_address: self.interface_address,
            public_endpoint: self.public_endpoint.clone(),
            private_endpoint: self.private_endpoint.clone(),
            public_key: self.public_key.clone(),
            network_cidr: self.network_cidr,
            dns: self.dns.clone(),
        }
    }
}

/// Hub binding captured in a credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSnapshot {
    pub interface_address: Ipv4Network,
    pub public_endpoint: String,
    pub private_endpoint: Option<String>,
    pub public_key: String,
    pub network_cidr: Ipv4Network,
    #[serde(default)]
    pub dns: Vec<String>,
}

/// Bounded-use fields of a group credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupQuota {
    pub group_name: String,
    pub max_uses: Option<u32>,
    pub use_count: u32,
}

impl GroupQuota {
    pub fn exhausted(&self) -> bool {
        self.max_uses.map_or(false, |max| self.use_count >= max)
    }
}

/// Enrollment credential (installation token)
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub secret: String,
    pub spoke_id: Uuid,
    pub spoke_label: String,
    #[serde(default)]
    pub allocated: Vec<Ipv4Network>,
    pub hub: HubSnapshot,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub consumed: bool,
    pub group: Option<GroupQuota>,
    pub persistent_keepalive: u16,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("spoke_label", &self.spoke_label)
            .field("allocated", &self.allocated)
            .field("expires_at", &self.expires_at)
            .field("consumed", &self.consumed)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Render the spoke-side tunnel configuration for this credential.
    ///
    /// The spoke generates its own key pair; its private key is only
    /// substituted locally, never sent to the hub.
    pub fn render_spoke_config(&self, private_key: &str) -> String {
        let address = self
            .allocated
            .first()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "# Address assigned at registration".to_string());

        let mut out = String::new();
        out.push_str(&format!("# {} ({})\n", self.spoke_label, self.spoke_id));
        out.push_str("[Interface]\n");
        if self.allocated.is_empty() {
            out.push_str(&format!("{}\n", address));
        } else {
            out.push_str(&format!("Address = {}\n", address));
        }
        out.push_str(&format!("PrivateKey = {}\n", private_key));
        if !self.hub.dns.is_empty() {
            out.push_str(&format!("DNS = {}\n", self.hub.dns.join(", ")));
        }
        out.push_str("\n# Hub\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.hub.public_key));
        out.push_str(&format!("Endpoint = {}\n", self.hub.public_endpoint));
        out.push_str(&format!("AllowedIPs = {}\n", self.hub.network_cidr));
        out.push_str(&format!("PersistentKeepalive = {}\n", self.persistent_keepalive));
        out
    }
}

/// Durable record of an enrolled spoke
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokeRegistration {
    pub id: Uuid,
    pub credential_id: Uuid,
    pub name: String,
    pub public_key: String,
    pub allocated: Vec<Ipv4Network>,
    pub registered_at: DateTime<Utc>,
    pub platform: Platform,
    pub hostname: Option<String>,
    pub machine_id: Option<String>,
    pub local_ip: Option<String>,
    pub cluster_id: Option<Uuid>,
    pub apply_state: ApplyState,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SpokeRegistration {
    /// The live-interface peer this registration must be backed by
    pub fn peer_entry(&self) -> PeerEntry {
        PeerEntry {
            name: self.name.clone(),
            id: self.id.to_string(),
            public_key: self.public_key.clone(),
            allowed_ips: self.allocated.iter().map(host_route).collect(),
        }
    }
}

/// Peer allowed-IP route for an allocated address: the single host
fn host_route(addr: &Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(addr.ip(), 32).unwrap_or(*addr)
}

/// One peer stanza of the live interface configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub id: String,
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Network>,
}

/// Everything a spoke presents when it enrolls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub secret: String,
    pub public_key: String,
    pub platform: Platform,
    pub hostname: Option<String>,
    pub machine_id: Option<String>,
    pub local_ip: Option<String>,
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Result of a successful enrollment
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub registration: SpokeRegistration,
    #[serde(skip_serializing)]
    pub credential: Credential,
}

/// Grouping of spokes that belong to one cluster (e.g. a Proxmox cluster)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub datacenter: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cluster together with its member spokes
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub spoke_ids: Vec<Uuid>,
}

/// Registry data enriched with live interface status
#[derive(Debug, Clone, Serialize)]
pub struct SpokeView {
    #[serde(flatten)]
    pub registration: SpokeRegistration,
    pub status: SpokeStatus,
    pub endpoint: Option<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Outcome of one registry/interface convergence pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    /// Registrations already backed by a peer
    pub in_sync: usize,
    /// Peers added for registrations that lacked one
    pub added: usize,
    /// Configured peers no registration owns, removed
    pub removed: usize,
    /// Add or remove attempts that failed
    pub failed: usize,
}

impl ConvergeReport {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}
