//! Serde-deserializable types matching the storefront API responses.

use serde::Deserialize;

use super::types::Order;
use super::FetchError;

/// Message the server sends with `success: false` when the session cookie is
/// missing or expired ("not logged in").
pub const NOT_LOGGED_IN: &str = "未登录";

/// Envelope wrapped around every storefront response.
#[derive(Debug, Default, Deserialize)]
pub struct ApiResponse {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub orders: Option<Vec<Order>>,
  #[serde(default)]
  pub order: Option<Order>,
}

/// Turn an HTTP status and body into a successful envelope or a typed failure.
pub fn parse_envelope(status: u16, body: &[u8]) -> Result<ApiResponse, FetchError> {
  if status == 401 {
    let message = serde_json::from_slice::<ApiResponse>(body)
      .ok()
      .and_then(|r| r.message)
      .unwrap_or_else(|| "unauthorized".to_string());
    return Err(FetchError::Unauthenticated(message));
  }

  if !(200..300).contains(&status) {
    return Err(FetchError::Status(status));
  }

  let response: ApiResponse =
    serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;

  if !response.success {
    let message = response.message.unwrap_or_default();
    if message == NOT_LOGGED_IN {
      return Err(FetchError::Unauthenticated(message));
    }
    return Err(FetchError::Rejected(message));
  }

  Ok(response)
}
