//! Edge forwarder: the deployed worker's request handler
//!
//! Every inbound request is answered with whatever `TO_ROUTE` returns for a
//! plain GET. The inbound method, headers and body are not forwarded.

use crate::error::ForwardError;
use crate::resource::{ProxySpec, FROM_ROUTE_VAR, TO_ROUTE_VAR};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderMap;
use hyper::{Request, Response, StatusCode};
use reqwest::redirect::Policy;
use tracing::info;
use url::Url;

/// Redirects followed before giving up
const MAX_REDIRECTS: usize = 20;

/// Upstream response, as received
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedResponse {
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Request handler bound to one worker's routes
#[derive(Clone)]
pub struct EdgeForwarder {
    from_route: String,
    to_route: String,
    client: reqwest::Client,
}

impl EdgeForwarder {
    /// Bind to the `FROM_ROUTE` / `TO_ROUTE` vars of a deployed spec
    pub fn new(spec: &ProxySpec) -> Result<Self, ForwardError> {
        let var = |name: &str| spec.vars.get(name).cloned().unwrap_or_default();
        Self::with_routes(var(FROM_ROUTE_VAR), var(TO_ROUTE_VAR))
    }

    pub fn with_routes(
        from_route: impl Into<String>,
        to_route: impl Into<String>,
    ) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(ForwardError::Client)?;

        Ok(Self {
            from_route: from_route.into(),
            to_route: to_route.into(),
            client,
        })
    }

    pub fn from_route(&self) -> &str {
        &self.from_route
    }

    pub fn to_route(&self) -> &str {
        &self.to_route
    }

    /// Fetch `TO_ROUTE`, following redirects
    pub async fn fetch(&self) -> Result<ForwardedResponse, ForwardError> {
        let url = Url::parse(&self.to_route).map_err(|source| ForwardError::InvalidDestination {
            value: self.to_route.clone(),
            source,
        })?;

        let upstream = |source| ForwardError::Upstream {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url.clone()).send().await.map_err(upstream)?;
        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response.bytes().await.map_err(upstream)?;

        info!("Response from {}: {} ({} bytes, final {})", url, status, body.len(), final_url);
        info!("Response status: {}", status.as_u16());

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }

    /// Answer an inbound request. Upstream error statuses are returned as-is.
    pub async fn handle<B>(&self, _request: Request<B>) -> Result<Response<Full<Bytes>>, ForwardError> {
        Ok(self.fetch().await?.into_response())
    }
}
