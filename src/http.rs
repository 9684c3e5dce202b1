//! Request and response values passed between the application, the engine and the network.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Header carrying the time a response was written to a cache store.
pub const CACHED_AT_HEADER: &str = "x-shelter-cached-at";
/// Marks a response served from an expired cache entry.
pub const STALE_HEADER: &str = "x-shelter-stale";
/// Marks a response served from cache after the network failed.
pub const FROM_CACHE_HEADER: &str = "x-shelter-from-cache";
/// Marks a generated placeholder image.
pub const PLACEHOLDER_HEADER: &str = "x-shelter-placeholder";

/// An outgoing request as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  /// Header names are lower-cased
  pub headers: BTreeMap<String, String>,
  pub body: Option<Body>,
  /// Top-level page navigation
  pub navigate: bool,
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
  Bytes(Vec<u8>),
  Multipart(Vec<Part>),
}

/// A single multipart form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
  pub name: String,
  pub file_name: Option<String>,
  pub content_type: Option<String>,
  pub data: Vec<u8>,
}

impl Part {
  pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      file_name: None,
      content_type: None,
      data: value.into().into_bytes(),
    }
  }
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: BTreeMap::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: Body) -> Self {
    self.body = Some(body);
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Whether the caller wants an HTML document back.
  pub fn accepts_html(&self) -> bool {
    self.navigate
      || self
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Whether the caller wants a JSON body back.
  pub fn accepts_json(&self) -> bool {
    self
      .header("accept")
      .is_some_and(|accept| accept.contains("application/json"))
  }

  /// Cache identity: the method plus the URL without its fragment.
  pub fn cache_key(&self) -> CacheKey {
    let mut url = self.url.clone();
    url.set_fragment(None);
    CacheKey {
      method: self.method.clone(),
      url: url.to_string(),
    }
  }
}

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  pub method: String,
  pub url: String,
}

/// A response returned by the network or served from a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  /// Header names are lower-cased
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.set_header(name, value);
    self
  }

  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_stale(&self) -> bool {
    self.header(STALE_HEADER) == Some("true")
  }

  pub fn is_from_cache(&self) -> bool {
    self.header(FROM_CACHE_HEADER) == Some("true")
  }

  /// Tag the response with the time it is being written to a store.
  pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
    self.set_header(CACHED_AT_HEADER, at.to_rfc3339());
    self
  }

  /// When this response was stored, from the custom header or the `date` header.
  pub fn stored_at(&self) -> Option<DateTime<Utc>> {
    if let Some(ts) = self.header(CACHED_AT_HEADER) {
      if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
        return Some(parsed.with_timezone(&Utc));
      }
    }
    self
      .header("date")
      .and_then(|date| DateTime::parse_from_rfc2822(date).ok())
      .map(|parsed| parsed.with_timezone(&Utc))
  }

  /// Canned 503 body for JSON callers when neither network nor cache can answer.
  pub fn offline_json(message: &str) -> Self {
    let body = serde_json::json!({
      "error": "network_unavailable",
      "message": message,
      "offline": true,
    });
    Response::new(503, body.to_string()).with_header("content-type", "application/json")
  }

  /// Generated stand-in for an image that could not be fetched.
  pub fn placeholder_image() -> Self {
    const SVG: &str = concat!(
      r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="150" viewBox="0 0 200 150">"##,
      r##"<rect width="200" height="150" fill="#e5e7eb"/>"##,
      r##"<text x="100" y="80" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Image unavailable offline</text>"##,
      "</svg>"
    );
    Response::new(200, SVG)
      .with_header("content-type", "image/svg+xml")
      .with_header("cache-control", "no-store")
      .with_header(PLACEHOLDER_HEADER, "true")
  }
}
