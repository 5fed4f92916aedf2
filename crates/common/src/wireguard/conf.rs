//! Structured interface configuration
//!
//! The configuration is held in memory as a list of peers and rendered
//! deterministically. The file form carries a `# Spoke: <name> (<id>)`
//! comment above each peer so that `parse` can recover names and ids.

use crate::types::PeerEntry;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;

/// The `[Interface]` section of the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSection {
    pub address: Ipv4Network,
    pub listen_port: u16,
    pub private_key: String,
}

/// Full hub configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: InterfaceSection,
    pub peers: Vec<PeerEntry>,
}

const PEER_COMMENT_PREFIX: &str = "# Spoke: ";

impl WgConfig {
    pub fn new(address: Ipv4Network, listen_port: u16, private_key: impl Into<String>) -> Self {
        Self {
            interface: InterfaceSection {
                address,
                listen_port,
                private_key: private_key.into(),
            },
            peers: Vec::new(),
        }
    }

    pub fn contains_key(&self, public_key: &str) -> bool {
        self.peers.iter().any(|p| p.public_key == public_key)
    }

    /// Index of the peer matching both name and key
    pub fn position(&self, name: &str, public_key: &str) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.name == name && p.public_key == public_key)
    }

    /// Copy of this config with `entry` appended
    pub fn with_peer(&self, entry: &PeerEntry) -> Self {
        let mut next = self.clone();
        next.peers.push(entry.clone());
        next
    }

    /// Copy of this config without the peer at `index`
    pub fn without_peer(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.peers.remove(index);
        next
    }

    /// File form, as read by `wg-quick`
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("Address = {}\n", self.interface.address));
        out.push_str(&format!("ListenPort = {}\n", self.interface.listen_port));
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
        for peer in &self.peers {
            out.push('\n');
            out.push_str(&format!("{}{} ({})\n", PEER_COMMENT_PREFIX, peer.name, peer.id));
            render_peer(&mut out, peer);
        }
        out
    }

    /// Stripped form accepted by `wg syncconf` (no `wg-quick` only keys)
    pub fn render_stripped(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("ListenPort = {}\n", self.interface.listen_port));
        out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
        for peer in &self.peers {
            out.push('\n');
            render_peer(&mut out, peer);
        }
        out
    }

    /// Parse the file form produced by `render`
    pub fn parse(text: &str) -> Result<Self> {
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut section = Section::None;
        let mut address = None;
        let mut listen_port = None;
        let mut private_key = None;
        let mut peers: Vec<PeerEntry> = Vec::new();
        let mut pending_label: Option<(String, String)> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let lineno = idx + 1;
            if line.is_empty() {
                continue;
            }
            if let Some(label) = line.strip_prefix(PEER_COMMENT_PREFIX) {
                pending_label = parse_label(label);
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            match line {
                "[Interface]" => {
                    section = Section::Interface;
                    continue;
                }
                "[Peer]" => {
                    section = Section::Peer;
                    let (name, id) = pending_label.take().unwrap_or_default();
                    peers.push(PeerEntry {
                        name,
                        id,
                        public_key: String::new(),
                        allowed_ips: Vec::new(),
                    });
                    continue;
                }
                _ => {}
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| Error::Config(format!("line {}: expected `Key = Value`", lineno)))?;

            match section {
                Section::Interface => match key {
                    "Address" => address = Some(parse_network(value, lineno)?),
                    "ListenPort" => {
                        listen_port = Some(value.parse::<u16>().map_err(|_| {
                            Error::Config(format!("line {}: bad ListenPort '{}'", lineno, value))
                        })?)
                    }
                    "PrivateKey" => private_key = Some(value.to_string()),
                    _ => {}
                },
                Section::Peer => {
                    // A `[Peer]` header always pushed an entry
                    let Some(peer) = peers.last_mut() else {
                        continue;
                    };
                    match key {
                        "PublicKey" => peer.public_key = value.to_string(),
                        "AllowedIPs" => {
                            peer.allowed_ips = value
                                .split(',')
                                .map(str::trim)
                                .filter(|v| !v.is_empty())
                                .map(|v| parse_network(v, lineno))
                                .collect::<Result<_>>()?
                        }
                        _ => {}
                    }
                }
                Section::None => {
                    return Err(Error::Config(format!(
                        "line {}: key outside of any section",
                        lineno
                    )))
                }
            }
        }

        let missing = |what: &str| Error::Config(format!("[Interface] is missing {}", what));
        if let Some(peer) = peers.iter().find(|p| p.public_key.is_empty()) {
            return Err(Error::Config(format!(
                "peer '{}' has no PublicKey",
                peer.name
            )));
        }
        Ok(Self {
            interface: InterfaceSection {
                address: address.ok_or_else(|| missing("Address"))?,
                listen_port: listen_port.ok_or_else(|| missing("ListenPort"))?,
                private_key: private_key.ok_or_else(|| missing("PrivateKey"))?,
            },
            peers,
        })
    }
}

fn render_peer(out: &mut String, peer: &PeerEntry) {
    let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
    out.push_str("[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", peer.public_key));
    out.push_str(&format!("AllowedIPs = {}\n", allowed.join(", ")));
}

/// `name (id)`; the id is the trailing balanced parenthesized group
fn parse_label(label: &str) -> Option<(String, String)> {
    let label = label.trim();
    let inner = label.strip_suffix(')')?;
    let mut depth = 1usize;
    for (pos, ch) in inner.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    let name = inner[..pos].strip_suffix(' ')?;
                    return Some((name.to_string(), inner[pos + 1..].to_string()));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_network(value: &str, lineno: usize) -> Result<Ipv4Network> {
    value
        .parse::<Ipv4Network>()
        .map_err(|_| Error::Config(format!("line {}: bad address '{}'", lineno, value)))
}
