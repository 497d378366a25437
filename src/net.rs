//! Network access for the worker.

use async_trait::async_trait;
use tracing::debug;

use crate::cache::{Request, Response};
use crate::error::{Error, Result};

/// Source of network responses.
///
/// A transport failure must come back as `Error::Network`; any HTTP answer,
/// whatever its status, is a `Response`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// HTTP network backed by reqwest.
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

fn network_error(request: &Request, reason: impl ToString) -> Error {
  Error::Network {
    url: request.url.to_string(),
    reason: reason.to_string(),
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| network_error(request, e))?;

    let mut builder = self.client.request(method, request.cache_url());
    if request.is_navigation() {
      builder = builder.header(reqwest::header::ACCEPT, "text/html");
    }

    let response = builder
      .send()
      .await
      .map_err(|e| network_error(request, e))?;

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
      .map_err(|e| network_error(request, e))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "Network response");

    Ok(Response {
      headers,
      ..Response::new(status, body)
    })
  }
}
