use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::{CourseId, UserId};

/// A purchase recorded by the storefront server.
///
/// Only `user_id` and `course_id` matter for entitlements; the rest is kept
/// for order listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
  #[serde(default)]
  pub id: u64,
  #[serde(default, alias = "user_id")]
  pub user_id: UserId,
  #[serde(alias = "course_id")]
  pub course_id: CourseId,
  #[serde(default, alias = "course_title")]
  pub course_title: Option<String>,
  #[serde(
    default,
    rename = "price",
    alias = "priceAtPurchase",
    deserialize_with = "deserialize_price"
  )]
  pub price_at_purchase: Option<f64>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(
    default,
    alias = "created_at",
    deserialize_with = "deserialize_timestamp"
  )]
  pub created_at: Option<DateTime<Utc>>,
}

/// Body of an order-creation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
  pub course_id: CourseId,
  pub course_title: String,
  pub price: f64,
}

impl PurchaseRequest {
  pub fn new(course_id: CourseId) -> Self {
    Self {
      course_id,
      course_title: String::new(),
      price: 0.0,
    }
  }
}

/// Prices arrive either as JSON numbers or as decimal strings.
fn deserialize_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Price {
    Number(f64),
    Text(String),
  }

  Ok(match Option::<Price>::deserialize(deserializer)? {
    Some(Price::Number(n)) => Some(n),
    Some(Price::Text(s)) => s.trim().parse().ok(),
    None => None,
  })
}

/// Timestamps arrive as RFC 3339 or as "YYYY-MM-DD HH:MM:SS". Anything else
/// is dropped rather than failing the whole order list.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw: Option<String> = Option::deserialize(deserializer)?;
  Ok(raw.as_deref().and_then(parse_timestamp))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .ok()
    .or_else(|| {
      NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .ok()
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snake_case_row() {
    let order: Order = serde_json::from_str(
      r#"{"id": 3, "user_id": 42, "course_id": 9, "course_title": "Rust",
          "price": "19.90", "status": "completed", "created_at": "2023-05-29T10:07:18.000Z"}"#,
    )
    .unwrap();

    assert_eq!(order.user_id, 42);
    assert_eq!(order.course_id, 9);
    assert_eq!(order.course_title.as_deref(), Some("Rust"));
    assert_eq!(order.price_at_purchase, Some(19.9));
    assert_eq!(order.created_at.unwrap().to_rfc3339(), "2023-05-29T10:07:18+00:00");
  }

  #[test]
  fn test_camel_case_row() {
    let order: Order = serde_json::from_str(
      r#"{"id": 1, "userId": 7, "courseId": 2, "price": 5, "createdAt": "2023-05-29 10:07:18"}"#,
    )
    .unwrap();

    assert_eq!(order.user_id, 7);
    assert_eq!(order.course_id, 2);
    assert_eq!(order.price_at_purchase, Some(5.0));
    assert!(order.created_at.is_some());
  }

  #[test]
  fn test_unparseable_timestamp_is_dropped() {
    let order: Order =
      serde_json::from_str(r#"{"userId": 7, "courseId": 2, "createdAt": "yesterday"}"#).unwrap();

    assert_eq!(order.created_at, None);
    assert_eq!(order.price_at_purchase, None);
  }

  #[test]
  fn test_purchase_request_body() {
    let body = serde_json::to_value(PurchaseRequest {
      course_id: 9,
      course_title: "Rust".to_string(),
      price: 19.9,
    })
    .unwrap();

    assert_eq!(
      body,
      serde_json::json!({"courseId": 9, "courseTitle": "Rust", "price": 19.9})
    );
  }
}
