//! Deployment configuration resolution
//!
//! Required values are looked up through an ordered list of layers (explicit
//! options first, then an environment snapshot). The first layer holding a
//! value wins; empty values are reported as missing afterwards.

use crate::error::ConfigError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

pub const DEFAULT_APP_NAME: &str = "cf-origin-rewrite";
pub const DEFAULT_STAGE: &str = "dev";

/// Lifecycle action applied to a named deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Up,
    Destroy,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Up => f.write_str("up"),
            Phase::Destroy => f.write_str("destroy"),
            Phase::Read => f.write_str("read"),
        }
    }
}

/// The five values that have no default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    AccountId,
    ApiToken,
    Passphrase,
    FromRoute,
    ToRoute,
}

impl RequiredField {
    /// Validation order
    pub const ALL: [RequiredField; 5] = [
        RequiredField::AccountId,
        RequiredField::ApiToken,
        RequiredField::Passphrase,
        RequiredField::FromRoute,
        RequiredField::ToRoute,
    ];

    pub fn env_var(self) -> &'static str {
        match self {
            RequiredField::AccountId => "CLOUDFLARE_ACCOUNT_ID",
            RequiredField::ApiToken => "CLOUDFLARE_API_TOKEN",
            RequiredField::Passphrase => "SECRET_ALCHEMY_PASSPHRASE",
            RequiredField::FromRoute => "FROM_ROUTE",
            RequiredField::ToRoute => "TO_ROUTE",
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            RequiredField::AccountId => "cloudflare-account-id",
            RequiredField::ApiToken => "cloudflare-api-token",
            RequiredField::Passphrase => "secret-alchemy-passphrase",
            RequiredField::FromRoute => "from-route",
            RequiredField::ToRoute => "to-route",
        }
    }
}

/// A source of required values
pub trait ConfigLayer {
    fn lookup(&self, field: RequiredField) -> Option<String>;
}

/// Values given directly on the command line
#[derive(Debug, Clone, Default)]
pub struct ExplicitOptions {
    pub account_id: Option<String>,
    pub api_token: Option<String>,
    pub passphrase: Option<String>,
    pub from_route: Option<String>,
    pub to_route: Option<String>,
}

impl ConfigLayer for ExplicitOptions {
    fn lookup(&self, field: RequiredField) -> Option<String> {
        match field {
            RequiredField::AccountId => self.account_id.clone(),
            RequiredField::ApiToken => self.api_token.clone(),
            RequiredField::Passphrase => self.passphrase.clone(),
            RequiredField::FromRoute => self.from_route.clone(),
            RequiredField::ToRoute => self.to_route.clone(),
        }
    }
}

/// Load `dir/.env` into the process environment; already-set variables win.
///
/// A missing file is not an error. A file that cannot be read or parsed is,
/// since dotenvy stops at the first bad line and would drop everything after it.
pub fn load_dotenv(dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let env_path = dir.join(".env");
    if !env_path.exists() {
        return Ok(None);
    }

    dotenvy::from_path(&env_path).map_err(|source| ConfigError::EnvFile {
        path: env_path.clone(),
        source,
    })?;
    debug!("Loaded {}", env_path.display());
    Ok(Some(env_path))
}

/// Snapshot of environment variables, passed explicitly to the resolver
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Snapshot the process environment. Call [`load_dotenv`] first so
    /// `.env` values are part of it.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl ConfigLayer for Environment {
    fn lookup(&self, field: RequiredField) -> Option<String> {
        self.get(field.env_var()).map(str::to_string)
    }
}

/// Options that always have a value
#[derive(Debug, Clone)]
pub struct GeneralOptions {
    pub app_name: String,
    pub stage: String,
    pub phase: Phase,
    pub quiet: bool,
    pub dev_mode: bool,
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            stage: DEFAULT_STAGE.to_string(),
            phase: Phase::Up,
            quiet: false,
            dev_mode: false,
        }
    }
}

/// Fully resolved input to one deployment action
#[derive(Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub app_name: String,
    pub stage: String,
    pub phase: Phase,
    pub quiet: bool,
    pub dev_mode: bool,
    pub account_id: String,
    pub api_token: String,
    pub passphrase: String,
    pub from_route: String,
    pub to_route: String,
}

impl fmt::Debug for DeploymentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentConfig")
            .field("app_name", &self.app_name)
            .field("stage", &self.stage)
            .field("phase", &self.phase)
            .field("quiet", &self.quiet)
            .field("dev_mode", &self.dev_mode)
            .field("account_id", &self.account_id)
            .field("api_token", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .field("from_route", &self.from_route)
            .field("to_route", &self.to_route)
            .finish()
    }
}

/// First value found across `layers`, in order
pub fn lookup(field: RequiredField, layers: &[&dyn ConfigLayer]) -> Option<String> {
    layers.iter().find_map(|layer| layer.lookup(field))
}

/// Resolve a [`DeploymentConfig`] from the given layers.
///
/// Every missing field is reported, in [`RequiredField::ALL`] order.
pub fn resolve(
    general: GeneralOptions,
    layers: &[&dyn ConfigLayer],
) -> Result<DeploymentConfig, ConfigError> {
    let mut missing = Vec::new();
    let mut values: HashMap<&'static str, String> = HashMap::new();

    for field in RequiredField::ALL {
        match lookup(field, layers) {
            Some(value) if !value.is_empty() => {
                values.insert(field.env_var(), value);
            }
            _ => missing.push(field),
        }
    }

    if !missing.is_empty() {
        let passphrase_suggestion = missing
            .contains(&RequiredField::Passphrase)
            .then(generate_passphrase_suggestion);
        return Err(ConfigError::Missing {
            fields: missing,
            passphrase_suggestion,
        });
    }

    let mut take = |field: RequiredField| values.remove(field.env_var()).unwrap_or_default();

    let config = DeploymentConfig {
        app_name: general.app_name,
        stage: general.stage,
        phase: general.phase,
        quiet: general.quiet,
        dev_mode: general.dev_mode,
        account_id: take(RequiredField::AccountId),
        api_token: take(RequiredField::ApiToken),
        passphrase: take(RequiredField::Passphrase),
        from_route: take(RequiredField::FromRoute),
        to_route: take(RequiredField::ToRoute),
    };

    validate_destination(&config.to_route)?;

    Ok(config)
}

fn validate_destination(to_route: &str) -> Result<(), ConfigError> {
    let url = Url::parse(to_route).map_err(|e| ConfigError::InvalidDestination {
        value: to_route.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidDestination {
            value: to_route.to_string(),
            reason: "URL has no host".to_string(),
        });
    }

    Ok(())
}

/// 128 random bits as 32 lowercase hex characters.
///
/// Advisory only: the caller prints it, it is never applied.
pub fn generate_passphrase_suggestion() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
