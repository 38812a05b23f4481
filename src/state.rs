//! Deployment state store
//!
//! Records which workers are deployed for each `(app_name, stage)` key,
//! along with a salted verifier of the passphrase that owns the key.

use crate::error::EngineError;
use crate::resource::DeployedWorker;
use crate::session::SessionKey;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Salted SHA-256 of a passphrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseVerifier {
    pub salt: String,
    pub digest: String,
}

impl PassphraseVerifier {
    pub fn new(passphrase: &str) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = to_hex(&salt);
        let digest = digest(&salt, passphrase);
        Self { salt, digest }
    }

    pub fn verify(&self, passphrase: &str) -> bool {
        digest(&self.salt, passphrase) == self.digest
    }
}

fn digest(salt: &str, passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(passphrase.as_bytes());
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A change staged by a session, written on finalize
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedChange {
    Put(DeployedWorker),
    Remove(String),
}

/// Durable record of deployed resources per session key
pub trait StateStore: Send + Sync {
    fn verifier(&self, key: &SessionKey) -> Result<Option<PassphraseVerifier>, EngineError>;

    fn resources(&self, key: &SessionKey) -> Result<Vec<DeployedWorker>, EngineError>;

    /// Atomically enroll `verifier` (if given) and apply `changes`
    fn commit(
        &self,
        key: &SessionKey,
        verifier: Option<&PassphraseVerifier>,
        changes: &[StagedChange],
    ) -> Result<(), EngineError>;
}

/// SQLite-backed state store
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteStateStore {
    /// Open (or create) a store on disk
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            location: path.as_ref().to_string_lossy().to_string(),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Ephemeral store that lives as long as the process
    pub fn in_memory() -> Result<Self, EngineError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            location: ":memory:".to_string(),
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn initialize(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                app_name TEXT NOT NULL,
                stage TEXT NOT NULL,
                salt TEXT NOT NULL,
                verifier TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (app_name, stage)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                app_name TEXT NOT NULL,
                stage TEXT NOT NULL,
                name TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (app_name, stage, name)
            )",
            [],
        )?;

        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn verifier(&self, key: &SessionKey) -> Result<Option<PassphraseVerifier>, EngineError> {
        let conn = self.conn.lock();

        let verifier = conn
            .query_row(
                "SELECT salt, verifier FROM sessions WHERE app_name = ?1 AND stage = ?2",
                params![key.app_name, key.stage],
                |row| {
                    Ok(PassphraseVerifier {
                        salt: row.get(0)?,
                        digest: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(verifier)
    }

    fn resources(&self, key: &SessionKey) -> Result<Vec<DeployedWorker>, EngineError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT record FROM resources WHERE app_name = ?1 AND stage = ?2 ORDER BY name",
        )?;
        let mut rows = stmt.query(params![key.app_name, key.stage])?;

        let mut workers = Vec::new();
        while let Some(row) = rows.next()? {
            let record: String = row.get(0)?;
            workers.push(serde_json::from_str(&record)?);
        }

        Ok(workers)
    }

    fn commit(
        &self,
        key: &SessionKey,
        verifier: Option<&PassphraseVerifier>,
        changes: &[StagedChange],
    ) -> Result<(), EngineError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(verifier) = verifier {
            tx.execute(
                "INSERT OR REPLACE INTO sessions (app_name, stage, salt, verifier)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key.app_name, key.stage, verifier.salt, verifier.digest],
            )?;
        }

        for change in changes {
            match change {
                StagedChange::Put(worker) => {
                    let record = serde_json::to_string(worker)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO resources (app_name, stage, name, record, updated_at)
                         VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
                        params![key.app_name, key.stage, worker.spec.name, record],
                    )?;
                }
                StagedChange::Remove(name) => {
                    tx.execute(
                        "DELETE FROM resources WHERE app_name = ?1 AND stage = ?2 AND name = ?3",
                        params![key.app_name, key.stage, name],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}
