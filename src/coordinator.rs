//! Coordinator Module
//!
//! Stateless client for the central coordinator. `register` and `heartbeat`
//! both POST to `{base}ping`, `deregister` POSTs to `{base}stop`. Every
//! failure (transport, timeout, non-success status, unparseable body) is
//! reported to the caller as an absent session or `false`.

use crate::upstream_connector::UpstreamConnector;
use crate::{NodeError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Build number reported to the coordinator.
pub const CLIENT_BUILD: u32 = 13;

/// TLS material issued by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCert {
    pub created_at: String,
    pub private_key: String,
    pub certificate: String,
}

/// Settings returned by a successful register or heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSession {
    pub image_server: String,
    pub latest_build: u32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub compromised: bool,
    #[serde(default)]
    pub tls: Option<TlsCert>,
}

impl NodeSession {
    pub fn tls_created_at(&self) -> Option<&str> {
        self.tls.as_ref().map(|tls| tls.created_at.as_str())
    }
}

/// What the node tells the coordinator about itself.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub secret: String,
    /// External port when one is configured, else the listening port
    pub port: u16,
    /// Cache capacity in bytes
    pub disk_space: u64,
    /// Egress limit in bytes per second, 0 when unlimited
    pub network_speed: u64,
    pub build_version: u32,
}

#[derive(Debug, Serialize)]
struct PingRequest<'a> {
    secret: &'a str,
    port: u16,
    disk_space: u64,
    network_speed: u64,
    build_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_created_at: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StopRequest<'a> {
    secret: &'a str,
}

/// Session calls the lifecycle controller makes against the coordinator.
pub trait Coordinator: Send + Sync + 'static {
    /// Log in and obtain a fresh session.
    fn register(&self) -> impl Future<Output = Option<NodeSession>> + Send;

    /// Report liveness; returns the replacement session.
    fn heartbeat(&self, current: &NodeSession)
        -> impl Future<Output = Option<NodeSession>> + Send;

    /// Ask to stop receiving traffic.
    fn deregister(&self) -> impl Future<Output = bool> + Send;
}

/// HTTP(S) coordinator client.
pub struct CoordinatorClient {
    client: Client<UpstreamConnector, Full<Bytes>>,
    base_url: String,
    identity: NodeIdentity,
    request_timeout: Duration,
}

impl CoordinatorClient {
    pub fn new(base_url: &str, identity: NodeIdentity, request_timeout: Duration) -> Result<Self> {
        let connector = UpstreamConnector::new(request_timeout)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            identity,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ping_request<'a>(&'a self, tls_created_at: Option<&'a str>) -> PingRequest<'a> {
        PingRequest {
            secret: &self.identity.secret,
            port: self.identity.port,
            disk_space: self.identity.disk_space,
            network_speed: self.identity.network_speed,
            build_version: self.identity.build_version,
            tls_created_at,
        }
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<Bytes> {
        let uri = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_vec(body)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| NodeError::HttpError(format!("Failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.request_timeout, async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| NodeError::ConnectionError(format!("Request to {} failed: {}", uri, e)))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| NodeError::HttpError(format!("Failed to read response: {}", e)))?
                .to_bytes();
            Ok::<_, NodeError>((status, body))
        })
        .await
        .map_err(|_| NodeError::TimeoutError(format!("Request to {} timed out", uri)))??;

        let (status, body) = response;
        if status != StatusCode::OK {
            return Err(NodeError::CoordinatorError(format!(
                "{} returned {}",
                uri, status
            )));
        }
        Ok(body)
    }

    /// Register, returning the error instead of logging it.
    pub async fn try_register(&self) -> Result<NodeSession> {
        let body = self.post_json("ping", &self.ping_request(None)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Heartbeat, returning the error instead of logging it. A response
    /// without TLS material keeps the current one.
    pub async fn try_heartbeat(&self, current: &NodeSession) -> Result<NodeSession> {
        let body = self
            .post_json("ping", &self.ping_request(current.tls_created_at()))
            .await?;
        let mut session: NodeSession = serde_json::from_slice(&body)?;
        if session.tls.is_none() {
            session.tls = current.tls.clone();
        }
        Ok(session)
    }

    /// Deregister, returning the error instead of logging it.
    pub async fn try_deregister(&self) -> Result<()> {
        let request = StopRequest {
            secret: &self.identity.secret,
        };
        self.post_json("stop", &request).await.map(|_| ())
    }
}

impl Coordinator for CoordinatorClient {
    async fn register(&self) -> Option<NodeSession> {
        info!("Registering with coordinator at {}", self.base_url);
        match self.try_register().await {
            Ok(session) => {
                info!(
                    "Registered: image_server={}, latest_build={}",
                    session.image_server, session.latest_build
                );
                Some(session)
            }
            Err(e) => {
                warn!("Registration failed: {}", e);
                None
            }
        }
    }

    async fn heartbeat(&self, current: &NodeSession) -> Option<NodeSession> {
        match self.try_heartbeat(current).await {
            Ok(session) => {
                debug!("Heartbeat accepted: image_server={}", session.image_server);
                Some(session)
            }
            Err(e) => {
                warn!("Heartbeat failed: {}", e);
                None
            }
        }
    }

    async fn deregister(&self) -> bool {
        info!("Deregistering from coordinator");
        match self.try_deregister().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Deregistration failed: {}", e);
                false
            }
        }
    }
}
