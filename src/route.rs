//! Source route classification and binding

use serde::{Deserialize, Serialize};

/// How a source route is attached to the deployed worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClassification {
    /// Whole-domain takeover
    DomainProxy,
    /// Path pattern under a domain
    PathScoped,
}

/// A route is a domain proxy iff it contains no `/`.
///
/// Purely syntactic; DNS and URL validity are not checked.
pub fn classify(route: &str) -> RouteClassification {
    if route.contains('/') {
        RouteClassification::PathScoped
    } else {
        RouteClassification::DomainProxy
    }
}

/// Binding of the source route onto the worker.
///
/// Serialized as `{"domains": [..]}` or `{"routes": [..]}`, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteBinding {
    #[serde(rename = "domains", with = "single")]
    Domain(String),
    #[serde(rename = "routes", with = "single")]
    Route(String),
}

impl RouteBinding {
    pub fn for_route(route: &str) -> Self {
        match classify(route) {
            RouteClassification::DomainProxy => RouteBinding::Domain(route.to_string()),
            RouteClassification::PathScoped => RouteBinding::Route(route.to_string()),
        }
    }

    pub fn domains(&self) -> Vec<String> {
        match self {
            RouteBinding::Domain(domain) => vec![domain.clone()],
            RouteBinding::Route(_) => Vec::new(),
        }
    }

    pub fn routes(&self) -> Vec<String> {
        match self {
            RouteBinding::Domain(_) => Vec::new(),
            RouteBinding::Route(route) => vec![route.clone()],
        }
    }

    /// Does an inbound request for `host` + `path` reach this binding?
    ///
    /// Domains match the host exactly. Route patterns are `host/path`, where
    /// a leading `*` in the host and a trailing `*` in the path are wildcards.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        match self {
            RouteBinding::Domain(domain) => domain.eq_ignore_ascii_case(host),
            RouteBinding::Route(pattern) => {
                let (host_pattern, path_pattern) = match pattern.find('/') {
                    Some(idx) => (&pattern[..idx], &pattern[idx..]),
                    None => (pattern.as_str(), "/*"),
                };
                host_matches(host_pattern, host) && path_matches(path_pattern, path)
            }
        }
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    match pattern.strip_prefix('*') {
        Some(suffix) => host.ends_with(suffix),
        None => pattern == host,
    }
}

fn path_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Serialize a single-value binding as a one-element list
mod single {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(std::iter::once(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let mut values = Vec::<String>::deserialize(deserializer)?;
        if values.len() != 1 {
            return Err(D::Error::invalid_length(values.len(), &"exactly one route"));
        }
        Ok(values.remove(0))
    }
}
