//! Deployment orchestrator: runs one lifecycle phase per invocation

use crate::config::{DeploymentConfig, Phase};
use crate::engine::{Credentials, ProvisioningEngine};
use crate::error::{EngineError, ProvisionError};
use crate::resource::{DeployedWorker, ProxySpec};
use crate::route::{classify, RouteClassification};
use crate::session::{InfraSession, SessionKey, StateMode};
use std::sync::Arc;
use tracing::{error, info};

/// Result of a successful phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `up`: the worker now answers at `url`
    Deployed { url: String, worker: DeployedWorker },
    /// `destroy`: names of the workers torn down
    Destroyed { removed: Vec<String> },
    /// `read`: workers currently recorded for the key
    State { workers: Vec<DeployedWorker> },
}

/// Build the worker description for `config`
pub fn build_proxy_spec(config: &DeploymentConfig) -> ProxySpec {
    let spec = ProxySpec::from_config(config);

    info!(
        "Creating worker {} to rewrite requests from {} to {}",
        spec.name, config.from_route, config.to_route
    );
    match classify(&config.from_route) {
        RouteClassification::DomainProxy => info!(
            "fromRoute is a domain, {} will be added to the worker's domains",
            config.from_route
        ),
        RouteClassification::PathScoped => info!(
            "fromRoute is not strictly a domain, {} will be added to the worker's routes",
            config.from_route
        ),
    }

    spec
}

/// Drives the provisioning engine through one phase
pub struct Orchestrator {
    engine: Arc<dyn ProvisioningEngine>,
    mode: StateMode,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ProvisioningEngine>, mode: StateMode) -> Self {
        Self { engine, mode }
    }

    /// Run `config.phase`.
    ///
    /// The session is finalized whether or not the phase succeeded, so any
    /// resource changes the engine made are always recorded.
    pub async fn run(&self, config: &DeploymentConfig) -> Result<Outcome, ProvisionError> {
        let key = SessionKey::new(&config.app_name, &config.stage);
        let fail = |source: EngineError| ProvisionError::new(config.phase, key.clone(), source);

        let mut session = InfraSession::open(config, self.mode.clone()).map_err(fail)?;
        let credentials = Credentials {
            account_id: config.account_id.clone(),
            api_token: config.api_token.clone(),
        };

        let result = match config.phase {
            Phase::Up => self.up(config, &credentials, &mut session).await,
            Phase::Destroy => self.destroy(&credentials, &mut session).await,
            Phase::Read => session.resources().map(|workers| Outcome::State { workers }),
        };

        let finalized = session.finalize();

        match (result, finalized) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(fail(e)),
            (Err(e), Ok(())) => Err(fail(e)),
            (Err(e), Err(commit_err)) => {
                error!("Failed to record state for {}: {}", key, commit_err);
                Err(fail(e))
            }
        }
    }

    async fn up(
        &self,
        config: &DeploymentConfig,
        credentials: &Credentials,
        session: &mut InfraSession,
    ) -> Result<Outcome, EngineError> {
        let spec = build_proxy_spec(config);

        let worker = self.engine.apply(credentials, &spec).await?;
        session.record(worker.clone())?;

        info!("Worker available at {}", config.from_route);

        Ok(Outcome::Deployed {
            url: config.from_route.clone(),
            worker,
        })
    }

    async fn destroy(
        &self,
        credentials: &Credentials,
        session: &mut InfraSession,
    ) -> Result<Outcome, EngineError> {
        let mut removed = Vec::new();

        for worker in session.resources()? {
            let name = worker.spec.name;
            self.engine.delete(credentials, &name).await?;
            session.forget(&name)?;
            info!("Destroyed worker {}", name);
            removed.push(name);
        }

        if removed.is_empty() {
            info!("Nothing deployed for {}", session.key());
        }

        Ok(Outcome::Destroyed { removed })
    }
}
