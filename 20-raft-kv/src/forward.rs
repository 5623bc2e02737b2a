//! HTTP calls between nodes: forwarding to the believed leader and join
//! attempts.
//!
//! A forward is a single bounded attempt. The upstream answer (status and
//! JSON body) is handed back unchanged so the client sees the leader's own
//! result; only transport failures become local errors.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, Url};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};

/// Marks a request that has already been forwarded once. Carries the origin
/// node id.
pub const FORWARDED_HEADER: &str = "x-raft-forwarded";

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path segments, percent-encoded when the URL is built.
    pub segments: Vec<String>,
    pub body: Option<Value>,
}

impl ForwardRequest {
    pub fn get(segments: &[&str]) -> Self {
        Self::new(Method::GET, segments, None)
    }

    pub fn post(segments: &[&str], body: Value) -> Self {
        Self::new(Method::POST, segments, Some(body))
    }

    pub fn delete(segments: &[&str]) -> Self {
        Self::new(Method::DELETE, segments, None)
    }

    fn new(method: Method, segments: &[&str], body: Option<Value>) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            body,
        }
    }
}

/// The leader's answer, relayed verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    origin: u64,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(origin: u64, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build forwarding client")?;
        Ok(Self {
            client,
            origin,
            timeout,
        })
    }

    /// Forwards a client request, marking it with [`FORWARDED_HEADER`].
    pub async fn send(&self, address: &str, request: &ForwardRequest) -> Result<ForwardedResponse> {
        self.dispatch(address, request, true).await
    }

    /// Sends a request originated by this node itself, such as a join attempt.
    pub async fn call(&self, address: &str, request: &ForwardRequest) -> Result<ForwardedResponse> {
        self.dispatch(address, request, false).await
    }

    async fn dispatch(
        &self,
        address: &str,
        request: &ForwardRequest,
        forwarded: bool,
    ) -> Result<ForwardedResponse> {
        let url = endpoint(address, &request.segments)?;
        debug!(method = %request.method, %url, forwarded, "sending to peer");

        let mut builder = self.client.request(request.method.clone(), url);
        if forwarded {
            builder = builder.header(FORWARDED_HEADER, self.origin.to_string());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| self.failure(address, err))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.failure(address, err))?;
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            json!({ "error": String::from_utf8_lossy(&bytes).into_owned() })
        });
        Ok(ForwardedResponse { status, body })
    }

    fn failure(&self, address: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::ForwardTimeout {
                address: address.to_string(),
                timeout: self.timeout,
            }
        } else {
            Error::Forward {
                address: address.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Builds `http://<address>/<segments..>`, adding the scheme when missing.
pub fn endpoint(address: &str, segments: &[String]) -> Result<Url> {
    let base = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let invalid = |message: String| Error::Forward {
        address: address.to_string(),
        message,
    };
    let mut url = Url::parse(&base).map_err(|err| invalid(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("address cannot carry a path".into()))?
        .clear()
        .extend(segments);
    Ok(url)
}
