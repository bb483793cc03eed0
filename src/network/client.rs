use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::types::{Request, Response};
use crate::error::TransportError;

/// Sends requests to the network.
///
/// Only transport-level failures are errors; any HTTP status, including
/// 4xx and 5xx, is a normal response.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// HTTP transport backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .build()
      .map_err(|e| TransportError::Request(format!("failed to build http client: {e}")))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    let mut builder = self.client.request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(timeout) = request.timeout {
      builder = builder.timeout(timeout);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        TransportError::Timeout(request.timeout.unwrap_or_default())
      } else {
        TransportError::from(e)
      }
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    debug!(method = %request.method, url = %request.url, status, "network response");
    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
