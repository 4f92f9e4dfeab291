//! Network seam: the request/response shapes the worker deals in and the
//! reqwest-backed transport.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// A POST with a JSON body.
  pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self> {
    let body = serde_json::to_vec(body).map_err(|e| eyre!("Failed to encode body: {}", e))?;
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Ok(Self {
      method: Method::POST,
      url,
      headers,
      body: Some(body),
    })
  }
}

/// A captured response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  /// Synthetic marker returned when the service could not be reached.
  pub fn offline() -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status: 503,
      headers,
      body: br#"{"error":"offline"}"#.to_vec(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

/// Anything that can perform a request over the network.
///
/// An `Err` means the service was unreachable (offline, DNS, timeout). A
/// reachable service that answers with an error status is an `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network access through reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub use stub::StubNetwork;
