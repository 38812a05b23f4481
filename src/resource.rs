//! Worker resource description handed to the provisioning engine

use crate::config::DeploymentConfig;
use crate::route::RouteBinding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entrypoint reference of the edge forwarder
pub const ENTRYPOINT: &str = "cf_origin_rewrite::forwarder::EdgeForwarder";
/// Platform compatibility date the worker is pinned to
pub const COMPATIBILITY_DATE: &str = "2025-06-20";
pub const COMPATIBILITY_FLAGS: &[&str] = &["nodejs_compat"];

pub const FROM_ROUTE_VAR: &str = "FROM_ROUTE";
pub const TO_ROUTE_VAR: &str = "TO_ROUTE";

/// Declarative description of the edge proxy worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub name: String,
    pub entrypoint: String,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    #[serde(flatten)]
    pub binding: RouteBinding,
    /// Plain-text variables exposed to the worker (`FROM_ROUTE`, `TO_ROUTE`)
    pub vars: BTreeMap<String, String>,
}

impl ProxySpec {
    /// Build the worker description for `config`: `{app_name}-{stage}`, with the source
    /// route bound as a domain or a route pattern.
    pub fn from_config(config: &DeploymentConfig) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(FROM_ROUTE_VAR.to_string(), config.from_route.clone());
        vars.insert(TO_ROUTE_VAR.to_string(), config.to_route.clone());

        Self {
            name: worker_name(&config.app_name, &config.stage),
            entrypoint: ENTRYPOINT.to_string(),
            compatibility_date: COMPATIBILITY_DATE.to_string(),
            compatibility_flags: COMPATIBILITY_FLAGS.iter().map(|s| s.to_string()).collect(),
            binding: RouteBinding::for_route(&config.from_route),
            vars,
        }
    }

    pub fn from_route(&self) -> Option<&str> {
        self.vars.get(FROM_ROUTE_VAR).map(String::as_str)
    }

    pub fn to_route(&self) -> Option<&str> {
        self.vars.get(TO_ROUTE_VAR).map(String::as_str)
    }
}

pub fn worker_name(app_name: &str, stage: &str) -> String {
    format!("{}-{}", app_name, stage)
}

/// A worker as recorded by the provisioning engine after an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedWorker {
    pub id: String,
    pub account_id: String,
    pub spec: ProxySpec,
    pub created_at: String,
    pub updated_at: String,
}
