use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, COOKIE};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{Config, ServerConfig};

use super::api_types::{parse_envelope, ApiResponse};
use super::types::{Order, PurchaseRequest};
use super::{FetchError, OrderSource};

/// Storefront API client for the order endpoints
#[derive(Clone)]
pub struct HttpOrderSource {
  client: reqwest::Client,
  base_url: Url,
  session_cookie: Option<HeaderValue>,
  timeout: Duration,
}

impl HttpOrderSource {
  pub fn new(server: &ServerConfig) -> Result<Self> {
    let timeout = server.timeout();

    let client = reqwest::Client::builder()
      .connect_timeout(timeout)
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    // Url::join drops the last path segment unless the base ends with '/'
    let mut base = server.url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid server url {}: {}", server.url, e))?;

    let session_cookie = server
      .session_cookie
      .clone()
      .or_else(Config::get_session_cookie)
      .map(|cookie| {
        HeaderValue::from_str(&cookie).map_err(|e| eyre!("Invalid session cookie: {}", e))
      })
      .transpose()?;

    Ok(Self {
      client,
      base_url,
      session_cookie,
      timeout,
    })
  }

  /// Send a request to an API endpoint and unwrap the response envelope
  async fn call(
    &self,
    method: Method,
    endpoint: &str,
    body: Option<&PurchaseRequest>,
  ) -> std::result::Result<ApiResponse, FetchError> {
    let url = self
      .base_url
      .join(endpoint)
      .map_err(|e| FetchError::Network(format!("invalid endpoint {}: {}", endpoint, e)))?;

    let mut request = self.client.request(method, url);
    if let Some(cookie) = &self.session_cookie {
      request = request.header(COOKIE, cookie.clone());
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(|e| self.transport_error(e))?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
    debug!(endpoint, status, len = bytes.len(), "Storefront response");

    parse_envelope(status, &bytes)
  }

  fn transport_error(&self, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else {
      FetchError::Network(e.to_string())
    }
  }
}

impl OrderSource for HttpOrderSource {
  /// List every order the session's account has placed
  async fn fetch_orders(&self) -> std::result::Result<Vec<Order>, FetchError> {
    let response = self.call(Method::GET, "api/orders", None).await?;
    Ok(response.orders.unwrap_or_default())
  }

  /// Place an order for a course
  async fn create_order(
    &self,
    request: &PurchaseRequest,
  ) -> std::result::Result<Option<Order>, FetchError> {
    let response = self
      .call(Method::POST, "api/purchase", Some(request))
      .await?;
    Ok(response.order)
  }
}
