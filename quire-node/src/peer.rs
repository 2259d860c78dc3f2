//! Bounded-timeout HTTP calls to other nodes.
//!
//! Used by election (`/uptime`), replication (`/state`) and the editor
//! client's discovery (`/health`). A call that does not finish within the
//! timeout is reported as failed; nothing here retries.

use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ElectionReport, HealthReport, UptimeReport};
use crate::store::Snapshot;

/// Outbound call failures. All of them are transient from the caller's view.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("request to {addr} timed out")]
    Timeout { addr: String },
    #[error("request to {addr} failed: {source}")]
    Request {
        addr: String,
        source: reqwest::Error,
    },
    #[error("{addr} answered with status {status}")]
    Status { addr: String, status: u16 },
}

/// HTTP client for peer endpoints.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to a default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self { http, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn get_json<T: DeserializeOwned>(&self, addr: &str, path: &str) -> Result<T, PeerError> {
        let url = format!("http://{addr}{path}");
        let call = async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|source| PeerError::Request {
                    addr: addr.to_string(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(PeerError::Status {
                    addr: addr.to_string(),
                    status: response.status().as_u16(),
                });
            }
            response.json::<T>().await.map_err(|source| PeerError::Request {
                addr: addr.to_string(),
                source,
            })
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout {
                addr: addr.to_string(),
            }),
        }
    }

    /// `GET /uptime`
    pub async fn uptime(&self, addr: &str) -> Result<UptimeReport, PeerError> {
        self.get_json(addr, "/uptime").await
    }

    /// `GET /health`
    pub async fn health(&self, addr: &str) -> Result<HealthReport, PeerError> {
        self.get_json(addr, "/health").await
    }

    /// `GET /state`
    pub async fn state(&self, addr: &str) -> Result<Snapshot, PeerError> {
        self.get_json(addr, "/state").await
    }

    /// `GET /election`
    pub async fn trigger_election(&self, addr: &str) -> Result<ElectionReport, PeerError> {
        self.get_json(addr, "/election").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = PeerClient::new(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = client.uptime(&format!("127.0.0.1:{port}")).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = PeerClient::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = client.health(&addr.to_string()).await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
