//! Parsers for `wg show` output

use crate::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;

/// Live state of the interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStatus {
    pub interface: String,
    pub public_key: String,
    pub listen_port: u16,
    pub peers: Vec<PeerStatus>,
}

impl InterfaceStatus {
    pub fn peer(&self, public_key: &str) -> Option<&PeerStatus> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }
}

/// Live state of one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

fn bad(what: &str, line: &str) -> Error {
    Error::ExternalCommand {
        command: "wg show".to_string(),
        detail: format!("unparseable {}: '{}'", what, line),
    }
}

fn none_if_unset(value: &str) -> Option<&str> {
    match value.trim() {
        "" | "(none)" => None,
        v => Some(v),
    }
}

fn split_ips(value: &str) -> Vec<String> {
    none_if_unset(value)
        .map(|v| {
            v.split(',')
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// `wg show <if> dump`
// ============================================================================

/// Parse the tab-separated dump format.
///
/// The first line describes the interface (private key, public key, listen
/// port, fwmark). Every following line is a peer: public key, preshared
/// key, endpoint, allowed ips, latest handshake (epoch seconds, 0 = never),
/// rx bytes, tx bytes, persistent keepalive.
pub fn parse_dump(interface: &str, text: &str) -> Result<InterfaceStatus> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(InterfaceStatus {
            interface: interface.to_string(),
            ..Default::default()
        });
    };

    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(bad("interface line", "<redacted>"));
    }
    let mut status = InterfaceStatus {
        interface: interface.to_string(),
        public_key: fields[1].to_string(),
        listen_port: fields[2].parse().map_err(|_| bad("listen port", fields[2]))?,
        peers: Vec::new(),
    };

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            return Err(bad("peer line", line));
        }
        let handshake: i64 = fields[4].parse().map_err(|_| bad("handshake", fields[4]))?;
        status.peers.push(PeerStatus {
            public_key: fields[0].to_string(),
            endpoint: none_if_unset(fields[2]).map(str::to_string),
            allowed_ips: split_ips(fields[3]),
            last_handshake: if handshake > 0 {
                Utc.timestamp_opt(handshake, 0).single()
            } else {
                None
            },
            rx_bytes: fields[5].parse().map_err(|_| bad("rx bytes", fields[5]))?,
            tx_bytes: fields[6].parse().map_err(|_| bad("tx bytes", fields[6]))?,
        });
    }
    Ok(status)
}

// ============================================================================
// `wg show <if>`
// ============================================================================

/// Parse the human-readable format. Fields are recognized by their line
/// prefix; peer fields attach to the most recent `peer:` line. Relative
/// handshake times are resolved against `now`.
pub fn parse_show(text: &str, now: DateTime<Utc>) -> Result<InterfaceStatus> {
    let mut status = InterfaceStatus::default();
    let mut current: Option<PeerStatus> = None;

    for raw in text.lines() {
        let line = raw.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if key == "peer" {
            if let Some(done) = current.take() {
                status.peers.push(done);
            }
            current = Some(PeerStatus {
                public_key: value.to_string(),
                ..Default::default()
            });
            continue;
        }

        match (current.as_mut(), key) {
            (None, "interface") => status.interface = value.to_string(),
            (None, "public key") => status.public_key = value.to_string(),
            (None, "listening port") => {
                status.listen_port = value.parse().map_err(|_| bad("listening port", value))?
            }
            (Some(peer), "endpoint") => peer.endpoint = none_if_unset(value).map(str::to_string),
            (Some(peer), "allowed ips") => peer.allowed_ips = split_ips(value),
            (Some(peer), "latest handshake") => {
                let at = parse_relative_time(value)
                    .and_then(|age| now.checked_sub_signed(age))
                    .ok_or_else(|| bad("handshake", value))?;
                peer.last_handshake = Some(at);
            }
            (Some(peer), "transfer") => {
                let (rx, tx) = parse_transfer(value).ok_or_else(|| bad("transfer", value))?;
                peer.rx_bytes = rx;
                peer.tx_bytes = tx;
            }
            _ => {}
        }
    }
    if let Some(done) = current.take() {
        status.peers.push(done);
    }
    Ok(status)
}

/// `1 minute, 30 seconds ago` or `Now`
pub fn parse_relative_time(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("now") {
        return Some(Duration::zero());
    }
    let body = text.strip_suffix("ago")?.trim();
    let mut total = Duration::zero();
    let mut seen = false;
    for part in body.split(',') {
        let mut words = part.split_whitespace();
        let amount: i64 = words.next()?.parse().ok()?;
        let unit = words.next()?;
        if words.next().is_some() {
            return None;
        }
        let step = match unit.trim_end_matches('s') {
            "year" => Duration::days(365),
            "day" => Duration::days(1),
            "hour" => Duration::hours(1),
            "minute" => Duration::minutes(1),
            "second" => Duration::seconds(1),
            _ => return None,
        };
        let amount = i32::try_from(amount).ok()?;
        total = total.checked_add(&step.checked_mul(amount)?)?;
        seen = true;
    }
    seen.then_some(total)
}

/// `1.23 MiB received, 456.78 KiB sent`
pub fn parse_transfer(text: &str) -> Option<(u64, u64)> {
    let (received, sent) = text.split_once(',')?;
    let rx = parse_bytes(received.trim().strip_suffix("received")?)?;
    let tx = parse_bytes(sent.trim().strip_suffix("sent")?)?;
    Some((rx, tx))
}

/// `456.78 KiB` and friends, in binary units
pub fn parse_bytes(text: &str) -> Option<u64> {
    let mut words = text.split_whitespace();
    let amount: f64 = words.next()?.parse().ok()?;
    let scale: f64 = match words.next()? {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    if amount < 0.0 || words.next().is_some() {
        return None;
    }
    Some((amount * scale).round() as u64)
}
