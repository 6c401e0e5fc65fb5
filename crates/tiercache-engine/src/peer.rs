//! HTTP client for the peer node protocol.
//!
//! ```text
//! GET    /cache/{key}  -> 200 {"value": ...} | 404
//! PUT    /cache/{key}  {"value": ..., "ttl": seconds} -> 200
//! DELETE /cache/{key}  -> 200
//! GET    /health       -> 200
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tiercache_core::{CacheError, CacheNode, Result};

/// Body of `GET /cache/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerValue {
    pub value: serde_json::Value,
}

/// Body of `PUT /cache/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerWrite {
    pub value: serde_json::Value,
    /// Seconds; 0 lets the receiving node apply its store default.
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Clone)]
pub struct PeerClient {
    http_client: reqwest::Client,
    read_timeout: Duration,
    write_timeout: Duration,
    probe_timeout: Duration,
}

impl PeerClient {
    pub fn new(read_timeout: Duration, write_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| CacheError::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            read_timeout,
            write_timeout,
            probe_timeout,
        })
    }

    fn cache_url(node: &CacheNode, key: &str) -> String {
        format!("{}/cache/{}", node.url, urlencoding::encode(key))
    }

    /// Fetch a key from a peer. A 404 is a miss, not an error.
    pub async fn get(&self, node: &CacheNode, key: &str) -> Result<Option<serde_json::Value>> {
        let response = self
            .http_client
            .get(Self::cache_url(node, key))
            .header("Accept", "application/json")
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(|e| unavailable(node, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CacheError::peer_unavailable(
                &node.id,
                format!("GET returned {status}"),
            ));
        }

        let body: PeerValue = response.json().await.map_err(|e| unavailable(node, e))?;
        Ok(Some(body.value))
    }

    pub async fn put(
        &self,
        node: &CacheNode,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let body = PeerWrite {
            value: value.clone(),
            ttl: ttl.as_secs(),
        };
        let response = self
            .http_client
            .put(Self::cache_url(node, key))
            .json(&body)
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(|e| unavailable(node, e))?;

        if !response.status().is_success() {
            return Err(CacheError::peer_unavailable(
                &node.id,
                format!("PUT returned {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Delete a key on a peer. A 404 counts as success.
    pub async fn delete(&self, node: &CacheNode, key: &str) -> Result<()> {
        let response = self
            .http_client
            .delete(Self::cache_url(node, key))
            .timeout(self.write_timeout)
            .send()
            .await
            .map_err(|e| unavailable(node, e))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(CacheError::peer_unavailable(
                &node.id,
                format!("DELETE returned {status}"),
            ));
        }
        Ok(())
    }

    /// `GET /health`. Returns the round-trip latency on a 200.
    pub async fn probe(&self, node: &CacheNode) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(format!("{}/health", node.url))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| unavailable(node, e))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(CacheError::peer_unavailable(
                &node.id,
                format!("health probe returned {}", response.status()),
            ));
        }
        Ok(started.elapsed())
    }
}

fn unavailable(node: &CacheNode, e: reqwest::Error) -> CacheError {
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    CacheError::peer_unavailable(&node.id, reason)
}
