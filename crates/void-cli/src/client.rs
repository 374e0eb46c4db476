//! HTTP client for the daemon's Unix-socket API.
//!
//! Connects with a bounded retry loop so `void` commands issued right after
//! daemon startup still land: retry every 250 ms within a 5 s deadline, and
//! after a 2 s cold-start grace stop early when nothing is listening (no
//! socket file means no daemon). Each request drives a fresh HTTP/1.1
//! connection over the socket.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::debug;

use void_core::api::{BlockRequest, StatusResponse, UnblockRequest};
use void_core::rules::Rule;

/// How long to keep retrying the initial connection.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Window in which a missing socket file is still treated as "daemon is
/// starting up" rather than "daemon is not running".
const COLD_START_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon is not running (socket {path}): {source}")]
    NotRunning {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Transport(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("daemon returned {status}: {message}")]
    Daemon { status: StatusCode, message: String },
}

/// Client bound to one socket path.
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Blocks `domain`; a zero `ttl` blocks permanently.
    pub async fn block(&self, domain: &str, ttl: Duration) -> Result<(), ClientError> {
        let request = BlockRequest {
            domain: domain.to_string(),
            ttl: u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX),
        };
        let body = serde_json::to_vec(&request)?;
        let (status, message) = self.request(Method::POST, "/v1/block", Some(body)).await?;
        expect_success(status, &message)
    }

    /// Removes the rule with the given id.
    pub async fn unblock(&self, id: &str) -> Result<(), ClientError> {
        let request = UnblockRequest { id: id.to_string() };
        let body = serde_json::to_vec(&request)?;
        let (status, message) = self.request(Method::POST, "/v1/unblock", Some(body)).await?;
        expect_success(status, &message)
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let (status, body) = self.request(Method::GET, "/v1/status", None).await?;
        expect_success(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn rules(&self) -> Result<Vec<Rule>, ClientError> {
        let (status, body) = self.request(Method::GET, "/v1/rules", None).await?;
        expect_success(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let stream = self.connect().await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ClientError::Transport)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "connection terminated");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "voidd");
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }

    /// Retry-connects within the startup deadline. After the cold-start
    /// grace, a missing socket file ends the retries early.
    async fn connect(&self) -> Result<UnixStream, ClientError> {
        let started = Instant::now();
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    let give_up = started.elapsed() >= STARTUP_TIMEOUT
                        || (started.elapsed() >= COLD_START_GRACE
                            && !self.socket_path.exists());
                    if give_up {
                        return Err(ClientError::NotRunning {
                            path: self.socket_path.clone(),
                            source: err,
                        });
                    }
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

fn expect_success(status: StatusCode, body: &[u8]) -> Result<(), ClientError> {
    if status.is_success() {
        return Ok(());
    }
    Err(ClientError::Daemon {
        status,
        message: String::from_utf8_lossy(body).trim().to_string(),
    })
}
