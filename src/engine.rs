//! Provisioning engine boundary and the local worker platform
//!
//! A [`ProvisioningEngine`] turns a [`ProxySpec`] into a live worker. The
//! [`LocalEngine`] provisions onto a [`WorkerRegistry`], which is what the
//! edge host serves from.

use crate::error::EngineError;
use crate::resource::{DeployedWorker, ProxySpec};
use crate::route::RouteBinding;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Account credentials the engine acts with
#[derive(Clone)]
pub struct Credentials {
    pub account_id: String,
    pub api_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

/// Creates, updates and tears down workers
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Create the worker, or replace the one with the same name
    async fn apply(
        &self,
        credentials: &Credentials,
        spec: &ProxySpec,
    ) -> Result<DeployedWorker, EngineError>;

    /// Remove the named worker. Returns false if it did not exist.
    async fn delete(&self, credentials: &Credentials, name: &str) -> Result<bool, EngineError>;
}

/// SQLite registry of workers deployed on the local platform
pub struct WorkerRegistry {
    conn: Mutex<Connection>,
}

impl WorkerRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;
        Ok(registry)
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        let registry = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                spec TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Insert or replace the worker named by `spec.name`, keeping its id
    pub fn upsert(&self, account_id: &str, spec: &ProxySpec) -> Result<DeployedWorker, EngineError> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().to_rfc3339();
        let encoded = serde_json::to_string(spec)?;

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, created_at FROM workers WHERE name = ?1",
                params![spec.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (id, created_at) = match existing {
            Some((id, created_at)) => {
                conn.execute(
                    "UPDATE workers SET account_id = ?1, spec = ?2, updated_at = ?3 WHERE id = ?4",
                    params![account_id, encoded, now, id],
                )?;
                (id, created_at)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO workers (id, name, account_id, spec, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, spec.name, account_id, encoded, now],
                )?;
                (id, now.clone())
            }
        };

        Ok(DeployedWorker {
            id,
            account_id: account_id.to_string(),
            spec: spec.clone(),
            created_at,
            updated_at: now,
        })
    }

    pub fn delete(&self, name: &str) -> Result<bool, EngineError> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM workers WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }

    pub fn get(&self, name: &str) -> Result<Option<DeployedWorker>, EngineError> {
        Ok(self.list()?.into_iter().find(|w| w.spec.name == name))
    }

    pub fn list(&self) -> Result<Vec<DeployedWorker>, EngineError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, account_id, spec, created_at, updated_at FROM workers ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;

        let mut workers = Vec::new();
        while let Some(row) = rows.next()? {
            let spec: String = row.get(2)?;
            workers.push(DeployedWorker {
                id: row.get(0)?,
                account_id: row.get(1)?,
                spec: serde_json::from_str(&spec)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            });
        }

        Ok(workers)
    }
}

/// Engine that provisions onto the local [`WorkerRegistry`]
pub struct LocalEngine {
    registry: Arc<WorkerRegistry>,
}

impl LocalEngine {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn check(&self, credentials: &Credentials, spec: &ProxySpec) -> Result<(), EngineError> {
        let reject = |reason: String| EngineError::Rejected {
            resource: spec.name.clone(),
            reason,
        };

        if credentials.account_id.is_empty() || credentials.api_token.is_empty() {
            return Err(reject("missing account credentials".to_string()));
        }
        if spec.name.is_empty() {
            return Err(reject("worker name is empty".to_string()));
        }
        if spec.to_route().is_none() {
            return Err(reject("TO_ROUTE binding is missing".to_string()));
        }

        // A domain or route may only be bound to one worker
        for other in self.registry.list()? {
            if other.spec.name != spec.name && same_binding(&other.spec.binding, &spec.binding) {
                return Err(reject(format!(
                    "{} is already bound to worker {}",
                    binding_label(&spec.binding),
                    other.spec.name
                )));
            }
        }

        Ok(())
    }
}

fn same_binding(a: &RouteBinding, b: &RouteBinding) -> bool {
    match (a, b) {
        (RouteBinding::Domain(x), RouteBinding::Domain(y)) => x.eq_ignore_ascii_case(y),
        (RouteBinding::Route(x), RouteBinding::Route(y)) => x == y,
        _ => false,
    }
}

fn binding_label(binding: &RouteBinding) -> &str {
    match binding {
        RouteBinding::Domain(domain) => domain,
        RouteBinding::Route(route) => route,
    }
}

#[async_trait]
impl ProvisioningEngine for LocalEngine {
    async fn apply(
        &self,
        credentials: &Credentials,
        spec: &ProxySpec,
    ) -> Result<DeployedWorker, EngineError> {
        self.check(credentials, spec)?;

        let worker = self.registry.upsert(&credentials.account_id, spec)?;
        info!("Worker {} deployed ({})", worker.spec.name, worker.id);
        Ok(worker)
    }

    async fn delete(&self, _credentials: &Credentials, name: &str) -> Result<bool, EngineError> {
        let removed = self.registry.delete(name)?;
        if removed {
            info!("Worker {} deleted", name);
        } else {
            debug!("Worker {} was not deployed", name);
        }
        Ok(removed)
    }
}
