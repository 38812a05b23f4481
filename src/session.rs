//! Infrastructure session: the per-invocation handle on deployment state

use crate::config::{DeploymentConfig, Phase};
use crate::error::EngineError;
use crate::resource::DeployedWorker;
use crate::state::{PassphraseVerifier, SqliteStateStore, StagedChange, StateStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of a deployment: `(app_name, stage)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub stage: String,
}

impl SessionKey {
    pub fn new(app_name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            stage: stage.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_name, self.stage)
    }
}

/// Where session state lives
#[derive(Clone)]
pub enum StateMode {
    /// Ephemeral, process-local state for iterative development
    PreferLocal,
    /// Durable external store
    Durable(Arc<dyn StateStore>),
}

/// Per-invocation session against the deployment state.
///
/// Changes are staged in memory and written by [`InfraSession::finalize`],
/// which must run on every exit path.
pub struct InfraSession {
    key: SessionKey,
    phase: Phase,
    quiet: bool,
    store: Arc<dyn StateStore>,
    enroll: Option<PassphraseVerifier>,
    staged: Vec<StagedChange>,
    finalized: bool,
}

impl InfraSession {
    /// Open a session for `config`.
    ///
    /// The passphrase is checked against the verifier recorded for the key.
    /// A key without a verifier is enrolled on the first mutating finalize.
    pub fn open(config: &DeploymentConfig, mode: StateMode) -> Result<Self, EngineError> {
        let key = SessionKey::new(&config.app_name, &config.stage);

        let store: Arc<dyn StateStore> = match mode {
            StateMode::PreferLocal => Arc::new(SqliteStateStore::in_memory()?),
            StateMode::Durable(store) => store,
        };

        let enroll = match store.verifier(&key)? {
            Some(verifier) if verifier.verify(&config.passphrase) => None,
            Some(_) => return Err(EngineError::PassphraseMismatch(key)),
            None if config.phase == Phase::Read => None,
            None => Some(PassphraseVerifier::new(&config.passphrase)),
        };

        debug!("Opened {} session for {}", config.phase, key);

        Ok(Self {
            key,
            phase: config.phase,
            quiet: config.quiet,
            store,
            enroll,
            staged: Vec::new(),
            finalized: false,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_read_only(&self) -> bool {
        self.phase == Phase::Read
    }

    /// Committed resources with staged changes applied on top
    pub fn resources(&self) -> Result<Vec<DeployedWorker>, EngineError> {
        let mut workers = self.store.resources(&self.key)?;

        for change in &self.staged {
            match change {
                StagedChange::Put(worker) => {
                    workers.retain(|w| w.spec.name != worker.spec.name);
                    workers.push(worker.clone());
                }
                StagedChange::Remove(name) => workers.retain(|w| &w.spec.name != name),
            }
        }

        workers.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(workers)
    }

    /// Stage a created or updated worker
    pub fn record(&mut self, worker: DeployedWorker) -> Result<(), EngineError> {
        self.stage(StagedChange::Put(worker))
    }

    /// Stage removal of a worker
    pub fn forget(&mut self, name: &str) -> Result<(), EngineError> {
        self.stage(StagedChange::Remove(name.to_string()))
    }

    fn stage(&mut self, change: StagedChange) -> Result<(), EngineError> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly(self.key.clone()));
        }
        self.staged.push(change);
        Ok(())
    }

    /// Write staged changes to the store. Safe to call more than once.
    pub fn finalize(&mut self) -> Result<(), EngineError> {
        if self.staged.is_empty() && self.enroll.is_none() {
            self.finalized = true;
            return Ok(());
        }

        self.store.commit(&self.key, self.enroll.as_ref(), &self.staged)?;
        if self.quiet {
            debug!("Committed {} change(s) for {}", self.staged.len(), self.key);
        } else {
            info!("Committed {} change(s) for {}", self.staged.len(), self.key);
        }

        self.staged.clear();
        self.enroll = None;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for InfraSession {
    fn drop(&mut self) {
        if !self.finalized && !self.staged.is_empty() {
            warn!(
                "Session for {} dropped with {} uncommitted change(s)",
                self.key,
                self.staged.len()
            );
        }
    }
}
