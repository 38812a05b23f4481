//! cf-origin-rewrite - deploy and host a single-route edge proxy
//!
//! Requests addressed to a vanity route (`FROM_ROUTE`) are answered with the
//! response of a fixed origin (`TO_ROUTE`). The crate provides:
//! - Layered configuration resolution (flags, then environment / `.env`)
//! - Route classification into domain or path-scoped bindings
//! - The `up` / `destroy` / `read` lifecycle against a provisioning engine
//! - The edge forwarder and a local host that serves deployed workers

pub mod config;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod host;
pub mod logging;
pub mod orchestrator;
pub mod resource;
pub mod route;
pub mod session;
pub mod state;

pub use config::{DeploymentConfig, Environment, ExplicitOptions, GeneralOptions, Phase, RequiredField};
pub use engine::{Credentials, LocalEngine, ProvisioningEngine, WorkerRegistry};
pub use error::{ConfigError, EngineError, ForwardError, ProvisionError};
pub use forwarder::EdgeForwarder;
pub use host::{EdgeHost, HostConfig};
pub use orchestrator::{build_proxy_spec, Orchestrator, Outcome};
pub use resource::{DeployedWorker, ProxySpec};
pub use route::{classify, RouteBinding, RouteClassification};
pub use session::{InfraSession, SessionKey, StateMode};
pub use state::{SqliteStateStore, StateStore};
