//! Local edge host
//!
//! Serves the workers in a [`WorkerRegistry`]: each inbound request is
//! matched by `Host` and path against the deployed domain and route
//! bindings, then answered by that worker's [`EdgeForwarder`].

use crate::engine::WorkerRegistry;
use crate::forwarder::EdgeForwarder;
use crate::resource::DeployedWorker;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Connection-scoped headers that are not relayed from the upstream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Edge host configuration
#[derive(Clone)]
pub struct HostConfig {
    pub port: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { port: 8787 }
    }
}

/// HTTP server hosting deployed workers
pub struct EdgeHost {
    config: HostConfig,
    registry: Arc<WorkerRegistry>,
    forwarders: Mutex<HashMap<String, (String, EdgeForwarder)>>,
}

impl EdgeHost {
    pub fn new(config: HostConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            config,
            registry,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Serve until the process ends
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Edge host listening on {}", addr);

        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Edge host shutting down");
                    return Ok(());
                }
            };

            let host = self.clone();
            tokio::spawn(async move {
                if let Err(e) = host.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let host = self.clone();
                    async move { host.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        match self.process_request(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {}", e);
                Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
            }
        }
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        if path == "/health" {
            return Ok(text_response(StatusCode::OK, "OK"));
        }

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| host_without_port(h).to_string());

        let host = match host {
            Some(h) if !h.is_empty() => h,
            _ => return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };

        let worker = match self.find_worker(&host, &path)? {
            Some(worker) => worker,
            None => return Ok(text_response(StatusCode::NOT_FOUND, "No worker bound to this route")),
        };

        let forwarder = self.forwarder_for(&worker)?;
        match forwarder.handle(req).await {
            Ok(response) => Ok(relay(response)),
            Err(e) => {
                warn!("Worker {} failed: {}", worker.spec.name, e);
                Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }

    /// First deployed worker whose binding matches; domains win over routes
    fn find_worker(&self, host: &str, path: &str) -> Result<Option<DeployedWorker>> {
        let workers = self.registry.list()?;
        self.prune_forwarders(&workers);

        let mut matching: Vec<DeployedWorker> = workers
            .into_iter()
            .filter(|w| w.spec.binding.matches(host, path))
            .collect();

        matching.sort_by_key(|w| w.spec.binding.routes().len());
        Ok(matching.into_iter().next())
    }

    /// Drop cached forwarders of workers no longer deployed
    fn prune_forwarders(&self, workers: &[DeployedWorker]) {
        let mut forwarders = self.forwarders.lock();
        let before = forwarders.len();
        forwarders.retain(|name, _| workers.iter().any(|w| w.spec.name == *name));

        let evicted = before - forwarders.len();
        if evicted > 0 {
            debug!("Evicted {} forwarder(s) for removed workers", evicted);
        }
    }

    /// Cached forwarder for `worker`, rebuilt when the worker is redeployed
    fn forwarder_for(&self, worker: &DeployedWorker) -> Result<EdgeForwarder> {
        let mut forwarders = self.forwarders.lock();

        if let Some((updated_at, forwarder)) = forwarders.get(&worker.spec.name) {
            if *updated_at == worker.updated_at {
                return Ok(forwarder.clone());
            }
        }

        let forwarder = EdgeForwarder::new(&worker.spec)?;
        forwarders.insert(
            worker.spec.name.clone(),
            (worker.updated_at.clone(), forwarder.clone()),
        );
        Ok(forwarder)
    }
}

/// Host part of a `Host` header value; IPv6 literals keep their brackets
fn host_without_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.split_once(':') {
        Some((host, _port)) => host,
        None => authority,
    }
}

fn relay(response: Response<Full<Bytes>>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (mut parts, body) = response.into_parts();
    for name in HOP_BY_HOP {
        parts.headers.remove(*name);
    }
    Response::from_parts(parts, body.map_err(|never| match never {}).boxed())
}

fn text_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
