use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use unblink_protocol::{ServiceAuth, ServiceDescriptor, ServiceKind};

use crate::auth;

/// A node as persisted.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub id: String,
    pub token: Option<String>,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub created_at: String,
    pub authorized_at: Option<String>,
    pub last_connected_at: Option<String>,
}

/// A stored worker/analysis event.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: String,
    pub service_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// SQLite-backed persistence for the relay.
///
/// One connection behind a mutex; every query here is short and
/// no long operation runs inside a transaction.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        // pragma_update, not execute_batch: journal_mode returns a row
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                token TEXT UNIQUE,
                owner_id TEXT REFERENCES users(id),
                name TEXT,
                created_at TEXT NOT NULL,
                authorized_at TEXT,
                last_connected_at TEXT
            );

            CREATE TABLE IF NOT EXISTS nodes_users (
                node_id TEXT NOT NULL REFERENCES nodes(id),
                user_id TEXT NOT NULL REFERENCES users(id),
                PRIMARY KEY (node_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL REFERENCES nodes(id),
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                addr TEXT NOT NULL,
                port INTEGER NOT NULL,
                path TEXT NOT NULL DEFAULT '',
                auth_username TEXT,
                auth_password TEXT,
                last_announced_at TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_service
                ON events(service_id, created_at);

            CREATE TABLE IF NOT EXISTS storage_items (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_storage_items_created
                ON storage_items(created_at);
            "#,
        )
        .context("Failed to run schema migration")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- users ---

    pub fn insert_user(&self, id: &str, email: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)",
            params![id, email, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM users WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // --- nodes ---

    /// Record a node that asked for authorization but has no owner yet.
    /// Idempotent: an existing row is left alone.
    pub fn ensure_pending_node(&self, node_id: &str) -> Result<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO nodes (id, created_at) VALUES (?1, ?2)",
            params![node_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn node_by_id(&self, node_id: &str) -> Result<Option<NodeRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, token, owner_id, name, created_at, authorized_at, last_connected_at
                 FROM nodes WHERE id = ?1",
                params![node_id],
                node_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn node_by_token(&self, token: &str) -> Result<Option<NodeRow>> {
        let conn = self.lock();
        // Token equality must not leak timing; scan candidates and compare
        // in constant time rather than letting the index shortcut.
        let mut stmt = conn.prepare(
            "SELECT id, token, owner_id, name, created_at, authorized_at, last_connected_at
             FROM nodes WHERE token IS NOT NULL",
        )?;
        let rows = stmt.query_map([], node_from_row)?;
        for row in rows {
            let row = row?;
            if let Some(candidate) = &row.token
                && auth::constant_time_eq(candidate.as_bytes(), token.as_bytes())
            {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Associate a node with a user, minting its registration token.
    ///
    /// Runs in a transaction: sets token/owner/authorized_at and records the
    /// association in nodes_users. Calling it again for the same pair
    /// returns the existing token unchanged.
    pub fn authorize_node(&self, node_id: &str, user_id: &str) -> Result<String> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT OR IGNORE INTO nodes (id, created_at) VALUES (?1, ?2)",
            params![node_id, now],
        )?;

        let existing: (Option<String>, Option<String>) = tx.query_row(
            "SELECT token, owner_id FROM nodes WHERE id = ?1",
            params![node_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let token = match existing {
            (Some(token), Some(owner)) if owner == user_id => token,
            (_, Some(owner)) if owner != user_id => {
                anyhow::bail!("node {node_id} is already owned by another user")
            }
            _ => {
                let token = auth::generate_token();
                tx.execute(
                    "UPDATE nodes SET token = ?2, owner_id = ?3, authorized_at = ?4 WHERE id = ?1",
                    params![node_id, token, user_id, now],
                )?;
                token
            }
        };

        tx.execute(
            "INSERT OR IGNORE INTO nodes_users (node_id, user_id) VALUES (?1, ?2)",
            params![node_id, user_id],
        )?;
        tx.commit()?;
        Ok(token)
    }

    pub fn set_last_connected(&self, node_id: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE nodes SET last_connected_at = ?2 WHERE id = ?1",
            params![node_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Detach a node from its owner, keeping the row (and token) around.
    /// The node can no longer register until someone authorizes it again.
    pub fn revoke_node_owner(&self, node_id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE nodes SET owner_id = NULL, authorized_at = NULL WHERE id = ?1",
            params![node_id],
        )?;
        tx.execute(
            "DELETE FROM nodes_users WHERE node_id = ?1",
            params![node_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn node_owned_by(&self, node_id: &str, user_id: &str) -> Result<bool> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM nodes WHERE id = ?1 AND owner_id = ?2",
            params![node_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // --- services ---

    pub fn upsert_service(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let (auth_username, auth_password) = match &descriptor.auth {
            Some(a) => (Some(a.username.as_str()), Some(a.password.as_str())),
            None => (None, None),
        };
        self.lock().execute(
            "INSERT INTO services
                 (id, node_id, name, type, addr, port, path,
                  auth_username, auth_password, last_announced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 node_id = excluded.node_id,
                 name = excluded.name,
                 type = excluded.type,
                 addr = excluded.addr,
                 port = excluded.port,
                 path = excluded.path,
                 auth_username = excluded.auth_username,
                 auth_password = excluded.auth_password,
                 last_announced_at = excluded.last_announced_at",
            params![
                descriptor.id,
                descriptor.node_id,
                descriptor.name,
                descriptor.kind.as_str(),
                descriptor.addr,
                descriptor.port,
                descriptor.path,
                auth_username,
                auth_password,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn services_for_node(&self, node_id: &str) -> Result<Vec<ServiceDescriptor>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, name, type, addr, port, path, auth_username, auth_password
             FROM services WHERE node_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![node_id], service_from_row)?;
        let mut services = Vec::new();
        for row in rows {
            services.push(row?);
        }
        Ok(services)
    }

    pub fn service_by_id(&self, service_id: &str) -> Result<Option<ServiceDescriptor>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, node_id, name, type, addr, port, path, auth_username, auth_password
                 FROM services WHERE id = ?1",
                params![service_id],
                service_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_service(&self, service_id: &str) -> Result<bool> {
        let changed = self.lock().execute(
            "DELETE FROM services WHERE id = ?1",
            params![service_id],
        )?;
        Ok(changed > 0)
    }

    // --- events ---

    pub fn insert_event(&self, id: &str, service_id: &str, payload: &serde_json::Value) -> Result<String> {
        let created_at = Utc::now().to_rfc3339();
        self.lock().execute(
            "INSERT INTO events (id, service_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, service_id, payload.to_string(), created_at],
        )?;
        Ok(created_at)
    }

    /// Most recent events for the given services, newest first.
    pub fn recent_events(&self, service_ids: &[String], limit: usize) -> Result<Vec<EventRow>> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let placeholders = vec!["?"; service_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, service_id, payload, created_at FROM events
             WHERE service_id IN ({placeholders})
             ORDER BY created_at DESC LIMIT {limit}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(service_ids.iter()),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )?;
        let mut events = Vec::new();
        for row in rows {
            let (id, service_id, payload, created_at) = row?;
            events.push(EventRow {
                id,
                service_id,
                payload: serde_json::from_str(&payload)
                    .unwrap_or(serde_json::Value::String(payload)),
                created_at,
            });
        }
        Ok(events)
    }

    // --- storage items ---

    pub fn insert_storage_item(
        &self,
        id: &str,
        service_id: &str,
        file_path: &str,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO storage_items (id, service_id, file_path, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, service_id, file_path, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete item rows older than the cutoff, returning their frame ids so
    /// the caller can unlink the files.
    pub fn prune_storage_items(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.lock();
        let cutoff = cutoff.to_rfc3339();
        let mut stmt = conn.prepare("SELECT id FROM storage_items WHERE created_at < ?1")?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
        let mut doomed = Vec::new();
        for row in rows {
            doomed.push(row?);
        }
        drop(stmt);
        conn.execute(
            "DELETE FROM storage_items WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(doomed)
    }
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        token: row.get(1)?,
        owner_id: row.get(2)?,
        name: row.get(3)?,
        created_at: row.get(4)?,
        authorized_at: row.get(5)?,
        last_connected_at: row.get(6)?,
    })
}

fn service_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceDescriptor> {
    let kind: String = row.get(3)?;
    let auth_username: Option<String> = row.get(7)?;
    let auth_password: Option<String> = row.get(8)?;
    Ok(ServiceDescriptor {
        id: row.get(0)?,
        node_id: row.get(1)?,
        name: row.get(2)?,
        kind: match kind.as_str() {
            "mjpeg" => ServiceKind::Mjpeg,
            _ => ServiceKind::Rtsp,
        },
        addr: row.get(4)?,
        port: row.get::<_, i64>(5)? as u16,
        path: row.get(6)?,
        auth: match (auth_username, auth_password) {
            (Some(username), Some(password)) => Some(ServiceAuth { username, password }),
            _ => None,
        },
    })
}
