//! SQLite registry for hub configuration, credentials, registrations and clusters
//!
//! `Database` owns the connection. Row helpers are free functions over a
//! `&Connection` so the ledger can compose them inside one
//! `Database::immediate` transaction.

use crate::config::ClusterUpdate;
use crate::pool::{flatten_allocated, StoredAddresses};
use crate::types::{
    ApplyState, Cluster, ClusterView, Credential, GroupQuota, HubInterface, HubSnapshot,
    SpokeRegistration,
};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// How long a writer waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database wrapper for the registry
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets status readers run while an enrollment holds the write lock
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Hub interface (singleton)
            CREATE TABLE IF NOT EXISTS hub_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                interface_address TEXT NOT NULL,
                listen_port INTEGER NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                network_cidr TEXT NOT NULL,
                public_endpoint TEXT NOT NULL,
                private_endpoint TEXT,
                dns TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Enrollment credentials
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                secret TEXT NOT NULL UNIQUE,
                spoke_id TEXT NOT NULL,
                spoke_label TEXT NOT NULL,
                allocated TEXT NOT NULL DEFAULT '[]',
                hub_snapshot TEXT NOT NULL,
                persistent_keepalive INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                used_at INTEGER,
                consumed INTEGER NOT NULL DEFAULT 0,
                is_group INTEGER NOT NULL DEFAULT 0,
                group_name TEXT,
                max_uses INTEGER,
                use_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_expires ON credentials(expires_at);

            -- Cluster groupings
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                datacenter TEXT,
                description TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Enrolled spokes
            CREATE TABLE IF NOT EXISTS registrations (
                id TEXT PRIMARY KEY,
                credential_id TEXT NOT NULL REFERENCES credentials(id),
                name TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                allocated TEXT NOT NULL DEFAULT '[]',
                registered_at INTEGER NOT NULL,
                platform TEXT NOT NULL,
                hostname TEXT,
                machine_id TEXT,
                local_ip TEXT,
                cluster_id TEXT REFERENCES clusters(id) ON DELETE SET NULL,
                apply_state TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null'
            );
            CREATE INDEX IF NOT EXISTS idx_registrations_credential ON registrations(credential_id);
            CREATE INDEX IF NOT EXISTS idx_registrations_cluster ON registrations(cluster_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` against the connection outside any explicit transaction
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so a read-then-write sequence in
    /// `f` cannot interleave with another writer, in this process or any
    /// other. The transaction commits only if `f` returns `Ok`.
    pub fn immediate<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ========================================================================
    // Convenience accessors
    // ========================================================================

    pub fn hub(&self) -> Result<Option<HubInterface>> {
        self.with_conn(load_hub)
    }

    /// Insert the singleton hub row
    pub fn insert_hub(&self, hub: &HubInterface) -> Result<()> {
        self.with_conn(|conn| insert_hub(conn, hub))
    }

    /// Persist the mutable hub fields
    pub fn update_hub(&self, hub: &HubInterface) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE hub_config SET public_endpoint = ?1, private_endpoint = ?2, dns = ?3,
                 updated_at = ?4 WHERE id = 1",
                params![
                    hub.public_endpoint,
                    hub.private_endpoint,
                    serde_json::to_string(&hub.dns)?,
                    to_millis(hub.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn registration(&self, id: Uuid) -> Result<Option<SpokeRegistration>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM registrations WHERE id = ?1", REGISTRATION_COLUMNS),
                    params![id.to_string()],
                    RawRegistration::from_row,
                )
                .optional()?;
            raw.map(RawRegistration::parse).transpose()
        })
    }

    pub fn list_registrations(&self) -> Result<Vec<SpokeRegistration>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM registrations ORDER BY registered_at ASC",
                REGISTRATION_COLUMNS
            ))?;
            let rows = stmt.query_map([], RawRegistration::from_row)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?.parse()?);
            }
            Ok(results)
        })
    }

    pub fn delete_registration(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM registrations WHERE id = ?1",
                params![id.to_string()],
            )?;
            if rows > 0 {
                debug!("Deleted registration {}", id);
            }
            Ok(rows > 0)
        })
    }

    pub fn set_apply_state(&self, id: Uuid, state: ApplyState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE registrations SET apply_state = ?1 WHERE id = ?2",
                params![state.to_string(), id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn credential(&self, id: Uuid) -> Result<Option<Credential>> {
        self.with_conn(|conn| credential_by_id(conn, id))
    }

    pub fn list_credentials(&self) -> Result<Vec<Credential>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM credentials ORDER BY created_at DESC",
                CREDENTIAL_COLUMNS
            ))?;
            let rows = stmt.query_map([], RawCredential::from_row)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?.parse()?);
            }
            Ok(results)
        })
    }

    /// Clusters with the ids of their member spokes
    pub fn list_clusters(&self) -> Result<Vec<ClusterView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM clusters ORDER BY name",
                CLUSTER_COLUMNS
            ))?;
            let rows = stmt.query_map([], raw_cluster)?;
            let mut views = Vec::new();
            for row in rows {
                let cluster = parse_cluster(row?)?;
                let spoke_ids = cluster_members(conn, cluster.id)?;
                views.push(ClusterView { cluster, spoke_ids });
            }
            Ok(views)
        })
    }

    pub fn cluster(&self, id: Uuid) -> Result<Option<ClusterView>> {
        self.with_conn(|conn| {
            let Some(cluster) = cluster_by_id(conn, id)? else {
                return Ok(None);
            };
            let spoke_ids = cluster_members(conn, id)?;
            Ok(Some(ClusterView { cluster, spoke_ids }))
        })
    }

    /// Apply a metadata edit; `None` when the cluster does not exist
    pub fn update_cluster(
        &self,
        id: Uuid,
        update: &ClusterUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Cluster>> {
        self.immediate(|tx| {
            let Some(mut cluster) = cluster_by_id(tx, id)? else {
                return Ok(None);
            };
            if let Some(datacenter) = &update.datacenter {
                cluster.datacenter = non_empty(datacenter);
            }
            if let Some(description) = &update.description {
                cluster.description = non_empty(description);
            }
            cluster.updated_at = now;
            tx.execute(
                "UPDATE clusters SET datacenter = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    cluster.datacenter,
                    cluster.description,
                    to_millis(now),
                    id.to_string()
                ],
            )?;
            Ok(Some(cluster))
        })
    }

    /// Delete a cluster with no member registrations
    pub fn delete_cluster(&self, id: Uuid) -> Result<Option<Cluster>> {
        self.immediate(|tx| {
            let Some(cluster) = cluster_by_id(tx, id)? else {
                return Ok(None);
            };
            let count: u32 = tx.query_row(
                "SELECT COUNT(*) FROM registrations WHERE cluster_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            if count > 0 {
                return Err(Error::ClusterHasNodes { count });
            }
            tx.execute("DELETE FROM clusters WHERE id = ?1", params![id.to_string()])?;
            debug!("Deleted cluster {}", id);
            Ok(Some(cluster))
        })
    }
}

// ============================================================================
// Row helpers
// ============================================================================

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Internal(format!("bad uuid '{}' in registry: {}", text, e)))
}

fn parse_network(text: &str) -> Result<Ipv4Network> {
    Ok(text.parse::<Ipv4Network>()?)
}

/// Whether a database error is a UNIQUE constraint violation
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// --- hub ---

pub fn load_hub(conn: &Connection) -> Result<Option<HubInterface>> {
    let raw = conn
        .query_row(
            "SELECT interface_address, listen_port, private_key, public_key, network_cidr,
                    public_endpoint, private_endpoint, dns, created_at, updated_at
             FROM hub_config WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            },
        )
        .optional()?;

    let Some((address, port, private_key, public_key, cidr, public_ep, private_ep, dns, created, updated)) =
        raw
    else {
        return Ok(None);
    };

    Ok(Some(HubInterface {
        interface_address: parse_network(&address)?,
        listen_port: port,
        private_key,
        public_key,
        network_cidr: parse_network(&cidr)?,
        public_endpoint: public_ep,
        private_endpoint: private_ep,
        dns: serde_json::from_str(&dns)?,
        created_at: from_millis(created),
        updated_at: from_millis(updated),
    }))
}

pub fn insert_hub(conn: &Connection, hub: &HubInterface) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO hub_config (id, interface_address, listen_port, private_key, public_key,
            network_cidr, public_endpoint, private_endpoint, dns, created_at, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            hub.interface_address.to_string(),
            hub.listen_port,
            hub.private_key,
            hub.public_key,
            hub.network_cidr.to_string(),
            hub.public_endpoint,
            hub.private_endpoint,
            serde_json::to_string(&hub.dns)?,
            to_millis(hub.created_at),
            to_millis(hub.updated_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(Error::AlreadyInitialized),
        Err(e) => Err(e.into()),
    }
}

// --- credentials ---

const CREDENTIAL_COLUMNS: &str = "id, secret, spoke_id, spoke_label, allocated, hub_snapshot, \
     persistent_keepalive, created_at, expires_at, used_at, consumed, is_group, group_name, \
     max_uses, use_count";

struct RawCredential {
    id: String,
    secret: String,
    spoke_id: String,
    spoke_label: String,
    allocated: String,
    hub_snapshot: String,
    persistent_keepalive: u16,
    created_at: i64,
    expires_at: i64,
    used_at: Option<i64>,
    consumed: bool,
    is_group: bool,
    group_name: Option<String>,
    max_uses: Option<u32>,
    use_count: u32,
}

impl RawCredential {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret: row.get(1)?,
            spoke_id: row.get(2)?,
            spoke_label: row.get(3)?,
            allocated: row.get(4)?,
            hub_snapshot: row.get(5)?,
            persistent_keepalive: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
            used_at: row.get(9)?,
            consumed: row.get(10)?,
            is_group: row.get(11)?,
            group_name: row.get(12)?,
            max_uses: row.get(13)?,
            use_count: row.get(14)?,
        })
    }

    fn parse(self) -> Result<Credential> {
        let hub: HubSnapshot = serde_json::from_str(&self.hub_snapshot)?;
        let group = if self.is_group {
            Some(GroupQuota {
                group_name: self.group_name.unwrap_or_default(),
                max_uses: self.max_uses,
                use_count: self.use_count,
            })
        } else {
            None
        };
        Ok(Credential {
            id: parse_uuid(&self.id)?,
            secret: self.secret,
            spoke_id: parse_uuid(&self.spoke_id)?,
            spoke_label: self.spoke_label,
            allocated: serde_json::from_str(&self.allocated)?,
            hub,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
            used_at: self.used_at.map(from_millis),
            consumed: self.consumed,
            group,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

pub fn insert_credential(conn: &Connection, cred: &Credential) -> Result<()> {
    let (group_name, max_uses, use_count) = match &cred.group {
        Some(g) => (Some(g.group_name.as_str()), g.max_uses, g.use_count),
        None => (None, None, 0),
    };
    conn.execute(
        &format!(
            "INSERT INTO credentials ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            CREDENTIAL_COLUMNS
        ),
        params![
            cred.id.to_string(),
            cred.secret,
            cred.spoke_id.to_string(),
            cred.spoke_label,
            serde_json::to_string(&cred.allocated)?,
            serde_json::to_string(&cred.hub)?,
            cred.persistent_keepalive,
            to_millis(cred.created_at),
            to_millis(cred.expires_at),
            cred.used_at.map(to_millis),
            cred.consumed,
            cred.group.is_some(),
            group_name,
            max_uses,
            use_count,
        ],
    )?;
    debug!("Inserted credential {}", cred.id);
    Ok(())
}

pub fn credential_by_secret(conn: &Connection, secret: &str) -> Result<Option<Credential>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM credentials WHERE secret = ?1", CREDENTIAL_COLUMNS),
            params![secret],
            RawCredential::from_row,
        )
        .optional()?;
    raw.map(RawCredential::parse).transpose()
}

pub fn credential_by_id(conn: &Connection, id: Uuid) -> Result<Option<Credential>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM credentials WHERE id = ?1", CREDENTIAL_COLUMNS),
            params![id.to_string()],
            RawCredential::from_row,
        )
        .optional()?;
    raw.map(RawCredential::parse).transpose()
}

/// Flip the consumption flag of a single-use credential if it is still unset.
/// Returns the number of rows changed (0 means another caller won).
pub fn mark_consumed(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE credentials SET consumed = 1, used_at = ?1
         WHERE id = ?2 AND consumed = 0 AND is_group = 0",
        params![to_millis(at), id.to_string()],
    )?)
}

/// Bump a group credential's use count while it is below its limit.
/// Returns the number of rows changed (0 means the limit was reached).
pub fn increment_group_use(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE credentials SET use_count = use_count + 1, used_at = ?1
         WHERE id = ?2 AND is_group = 1 AND (max_uses IS NULL OR use_count < max_uses)",
        params![to_millis(at), id.to_string()],
    )?)
}

/// Delete a credential that has never been used
pub fn delete_unused_credential(conn: &Connection, id: Uuid) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM credentials WHERE id = ?1 AND consumed = 0 AND use_count = 0",
        params![id.to_string()],
    )?)
}

/// Delete never-used credentials that expired before `now`
pub fn delete_expired_credentials(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM credentials WHERE consumed = 0 AND use_count = 0 AND expires_at < ?1",
        params![to_millis(now)],
    )?)
}

// --- registrations ---

const REGISTRATION_COLUMNS: &str = "id, credential_id, name, public_key, allocated, registered_at, \
     platform, hostname, machine_id, local_ip, cluster_id, apply_state, metadata";

struct RawRegistration {
    id: String,
    credential_id: String,
    name: String,
    public_key: String,
    allocated: String,
    registered_at: i64,
    platform: String,
    hostname: Option<String>,
    machine_id: Option<String>,
    local_ip: Option<String>,
    cluster_id: Option<String>,
    apply_state: String,
    metadata: String,
}

impl RawRegistration {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            credential_id: row.get(1)?,
            name: row.get(2)?,
            public_key: row.get(3)?,
            allocated: row.get(4)?,
            registered_at: row.get(5)?,
            platform: row.get(6)?,
            hostname: row.get(7)?,
            machine_id: row.get(8)?,
            local_ip: row.get(9)?,
            cluster_id: row.get(10)?,
            apply_state: row.get(11)?,
            metadata: row.get(12)?,
        })
    }

    fn parse(self) -> Result<SpokeRegistration> {
        Ok(SpokeRegistration {
            id: parse_uuid(&self.id)?,
            credential_id: parse_uuid(&self.credential_id)?,
            name: self.name,
            public_key: self.public_key,
            allocated: serde_json::from_str(&self.allocated)?,
            registered_at: from_millis(self.registered_at),
            platform: self.platform.parse().map_err(Error::Internal)?,
            hostname: self.hostname,
            machine_id: self.machine_id,
            local_ip: self.local_ip,
            cluster_id: self.cluster_id.as_deref().map(parse_uuid).transpose()?,
            apply_state: self.apply_state.parse().map_err(Error::Internal)?,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

pub fn insert_registration(conn: &Connection, reg: &SpokeRegistration) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO registrations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            REGISTRATION_COLUMNS
        ),
        params![
            reg.id.to_string(),
            reg.credential_id.to_string(),
            reg.name,
            reg.public_key,
            serde_json::to_string(&reg.allocated)?,
            to_millis(reg.registered_at),
            reg.platform.to_string(),
            reg.hostname,
            reg.machine_id,
            reg.local_ip,
            reg.cluster_id.map(|id| id.to_string()),
            reg.apply_state.to_string(),
            serde_json::to_string(&reg.metadata)?,
        ],
    );
    match result {
        Ok(_) => {
            debug!("Inserted registration {}", reg.id);
            Ok(())
        }
        Err(e) if is_unique_violation(&e) => Err(Error::DuplicatePublicKey),
        Err(e) => Err(e.into()),
    }
}

pub fn public_key_registered(conn: &Connection, public_key: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM registrations WHERE public_key = ?1",
        params![public_key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Name of an existing registration under `credential_id` from the same host
pub fn find_group_duplicate(
    conn: &Connection,
    credential_id: Uuid,
    hostname: &str,
    machine_id: Option<&str>,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT name FROM registrations
             WHERE credential_id = ?1 AND (hostname = ?2 OR (?3 IS NOT NULL AND machine_id = ?3))
             LIMIT 1",
            params![credential_id.to_string(), hostname, machine_id],
            |row| row.get(0),
        )
        .optional()?)
}

// --- clusters ---

const CLUSTER_COLUMNS: &str = "id, name, datacenter, description, created_at, updated_at";

type RawCluster = (String, String, Option<String>, Option<String>, i64, i64);

fn raw_cluster(row: &Row<'_>) -> rusqlite::Result<RawCluster> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_cluster((id, name, datacenter, description, created, updated): RawCluster) -> Result<Cluster> {
    Ok(Cluster {
        id: parse_uuid(&id)?,
        name,
        datacenter,
        description,
        created_at: from_millis(created),
        updated_at: from_millis(updated),
    })
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn cluster_by_id(conn: &Connection, id: Uuid) -> Result<Option<Cluster>> {
    conn.query_row(
        &format!("SELECT {} FROM clusters WHERE id = ?1", CLUSTER_COLUMNS),
        params![id.to_string()],
        raw_cluster,
    )
    .optional()?
    .map(parse_cluster)
    .transpose()
}

fn cluster_members(conn: &Connection, id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt =
        conn.prepare("SELECT id FROM registrations WHERE cluster_id = ?1 ORDER BY registered_at")?;
    let ids = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
    let mut members = Vec::new();
    for id in ids {
        members.push(parse_uuid(&id?)?);
    }
    Ok(members)
}

pub fn get_or_create_cluster(conn: &Connection, name: &str, now: DateTime<Utc>) -> Result<Cluster> {
    let existing = conn
        .query_row(
            &format!("SELECT {} FROM clusters WHERE name = ?1", CLUSTER_COLUMNS),
            params![name],
            raw_cluster,
        )
        .optional()?;
    if let Some(raw) = existing {
        return parse_cluster(raw);
    }

    let cluster = Cluster {
        id: Uuid::new_v4(),
        name: name.to_string(),
        datacenter: None,
        description: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO clusters (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            cluster.id.to_string(),
            cluster.name,
            to_millis(now),
            to_millis(now)
        ],
    )?;
    info!("Created cluster {} ({})", cluster.name, cluster.id);
    Ok(cluster)
}

// --- address snapshot ---

/// Every address currently spoken for: all credential allocations, all
/// registration allocations, and the hub's own address.
pub fn used_addresses(conn: &Connection, hub_address: Ipv4Addr) -> Result<HashSet<Ipv4Addr>> {
    let mut records = Vec::new();
    for table in ["credentials", "registrations"] {
        let mut stmt = conn.prepare(&format!("SELECT allocated FROM {}", table))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            records.push(StoredAddresses::Encoded(row?));
        }
    }
    let mut used: HashSet<Ipv4Addr> = flatten_allocated(records)?.into_iter().collect();
    used.insert(hub_address);
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use chrono::Duration as ChronoDuration;

    fn snapshot() -> HubSnapshot {
        HubSnapshot {
            interface_address: "10.0.1.1/24".parse().unwrap(),
            public_endpoint: "vpn.example.com:51820".to_string(),
            private_endpoint: None,
            public_key: "hubkey".to_string(),
            network_cidr: "10.0.1.0/24".parse().unwrap(),
            dns: vec![],
        }
    }

    fn credential(secret: &str, address: &str) -> Credential {
        let now = Utc::now();
        Credential {
            id: Uuid::new_v4(),
            secret: secret.to_string(),
            spoke_id: Uuid::new_v4(),
            spoke_label: "edge".to_string(),
            allocated: vec![address.parse().unwrap()],
            hub: snapshot(),
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
            used_at: None,
            consumed: false,
            group: None,
            persistent_keepalive: 25,
        }
    }

    fn registration(cred: &Credential, key: &str) -> SpokeRegistration {
        SpokeRegistration {
            id: cred.spoke_id,
            credential_id: cred.id,
            name: cred.spoke_label.clone(),
            public_key: key.to_string(),
            allocated: cred.allocated.clone(),
            registered_at: Utc::now(),
            platform: Platform::Linux,
            hostname: Some("host-a".to_string()),
            machine_id: None,
            local_ip: None,
            cluster_id: None,
            apply_state: ApplyState::Provisioning,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_credential_crud() {
        let db = Database::open_memory().unwrap();
        let cred = credential("s1", "10.0.1.2/24");
        db.with_conn(|c| insert_credential(c, &cred)).unwrap();

        let loaded = db
            .with_conn(|c| credential_by_secret(c, "s1"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, cred.id);
        assert_eq!(loaded.allocated, cred.allocated);
        assert_eq!(loaded.hub, cred.hub);
        assert!(!loaded.consumed);

        assert_eq!(db.with_conn(|c| mark_consumed(c, cred.id, Utc::now())).unwrap(), 1);
        assert_eq!(db.with_conn(|c| mark_consumed(c, cred.id, Utc::now())).unwrap(), 0);

        // Consumed rows are never deleted
        assert_eq!(db.with_conn(|c| delete_unused_credential(c, cred.id)).unwrap(), 0);
        assert!(db.credential(cred.id).unwrap().unwrap().used_at.is_some());
    }

    #[test]
    fn test_used_addresses_snapshot() {
        let db = Database::open_memory().unwrap();
        let a = credential("s1", "10.0.1.2/24");
        let b = credential("s2", "10.0.1.3/24");
        db.with_conn(|c| {
            insert_credential(c, &a)?;
            insert_credential(c, &b)?;
            insert_registration(c, &registration(&a, "key-a"))
        })
        .unwrap();

        let used = db
            .with_conn(|c| used_addresses(c, "10.0.1.1".parse().unwrap()))
            .unwrap();
        let mut used: Vec<String> = used.iter().map(|ip| ip.to_string()).collect();
        used.sort();
        assert_eq!(used, vec!["10.0.1.1", "10.0.1.2", "10.0.1.3"]);
    }

    #[test]
    fn test_duplicate_public_key_maps_to_conflict() {
        let db = Database::open_memory().unwrap();
        let a = credential("s1", "10.0.1.2/24");
        let b = credential("s2", "10.0.1.3/24");
        db.with_conn(|c| {
            insert_credential(c, &a)?;
            insert_credential(c, &b)?;
            insert_registration(c, &registration(&a, "same-key"))
        })
        .unwrap();

        let err = db
            .with_conn(|c| insert_registration(c, &registration(&b, "same-key")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePublicKey));
    }

    #[test]
    fn test_immediate_rolls_back_on_error() {
        let db = Database::open_memory().unwrap();
        let cred = credential("s1", "10.0.1.2/24");
        let result: Result<()> = db.immediate(|tx| {
            insert_credential(tx, &cred)?;
            Err(Error::Internal("abort".to_string()))
        });
        assert!(result.is_err());
        assert!(db.credential(cred.id).unwrap().is_none());
    }

    #[test]
    fn test_cluster_get_or_create() {
        let db = Database::open_memory().unwrap();
        let first = db
            .with_conn(|c| get_or_create_cluster(c, "pve-east", Utc::now()))
            .unwrap();
        let again = db
            .with_conn(|c| get_or_create_cluster(c, "pve-east", Utc::now()))
            .unwrap();
        assert_eq!(first.id, again.id);
        let clusters = db.list_clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].spoke_ids.is_empty());
    }

    #[test]
    fn test_cluster_update_sets_and_clears_metadata() {
        let db = Database::open_memory().unwrap();
        let cluster = db
            .with_conn(|c| get_or_create_cluster(c, "pve-east", Utc::now()))
            .unwrap();

        let edit = ClusterUpdate {
            datacenter: Some("fra1".to_string()),
            description: Some("  rack 4  ".to_string()),
        };
        let updated = db.update_cluster(cluster.id, &edit, Utc::now()).unwrap().unwrap();
        assert_eq!(updated.datacenter.as_deref(), Some("fra1"));
        assert_eq!(updated.description.as_deref(), Some("rack 4"));

        // Untouched fields keep their value; an empty string clears
        let clear = ClusterUpdate {
            datacenter: Some(String::new()),
            description: None,
        };
        db.update_cluster(cluster.id, &clear, Utc::now()).unwrap();
        let view = db.cluster(cluster.id).unwrap().unwrap();
        assert!(view.cluster.datacenter.is_none());
        assert_eq!(view.cluster.description.as_deref(), Some("rack 4"));

        assert!(db.update_cluster(Uuid::new_v4(), &edit, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_cluster_delete_refuses_members() {
        let db = Database::open_memory().unwrap();
        let cred = credential("s1", "10.0.1.2/24");
        let cluster = db
            .with_conn(|c| get_or_create_cluster(c, "pve-east", Utc::now()))
            .unwrap();
        let mut member = registration(&cred, "key-a");
        member.cluster_id = Some(cluster.id);
        db.with_conn(|c| {
            insert_credential(c, &cred)?;
            insert_registration(c, &member)
        })
        .unwrap();

        let err = db.delete_cluster(cluster.id).unwrap_err();
        assert!(matches!(err, Error::ClusterHasNodes { count: 1 }));
        assert_eq!(db.cluster(cluster.id).unwrap().unwrap().spoke_ids, vec![member.id]);

        assert!(db.delete_registration(member.id).unwrap());
        assert!(db.delete_cluster(cluster.id).unwrap().is_some());
        assert!(db.cluster(cluster.id).unwrap().is_none());
        assert!(db.delete_cluster(cluster.id).unwrap().is_none());
    }
}
