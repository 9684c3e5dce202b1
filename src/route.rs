//! Request classification into semantic categories.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::fmt;
use tracing::trace;

use crate::config::RoutesConfig;
use crate::http::Request;

/// Semantic category of a request; selects the strategy and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
  Static,
  Images,
  Fonts,
  Api,
  Data,
  Pages,
  NetworkOnly,
}

impl Category {
  pub const ALL: [Category; 7] = [
    Category::Static,
    Category::Images,
    Category::Fonts,
    Category::Api,
    Category::Data,
    Category::Pages,
    Category::NetworkOnly,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Category::Static => "static",
      Category::Images => "images",
      Category::Fonts => "fonts",
      Category::Api => "api",
      Category::Data => "data",
      Category::Pages => "pages",
      Category::NetworkOnly => "network-only",
    }
  }

  /// Whether responses in this category are ever written to a store.
  pub fn is_cacheable(&self) -> bool {
    !matches!(self, Category::NetworkOnly)
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

const IGNORED_SCHEMES: &[&str] = &["chrome-extension", "moz-extension", "safari-web-extension"];

/// Ordered pattern matcher; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
  sensitive_prefixes: Vec<String>,
  static_re: Regex,
  font_re: Regex,
  image_re: Regex,
  api_re: Regex,
  data_re: Regex,
  page_prefixes: Vec<String>,
}

impl RouteClassifier {
  pub fn new(routes: &RoutesConfig) -> Result<Self> {
    Ok(Self {
      sensitive_prefixes: routes.sensitive_prefixes.clone(),
      static_re: compile("static_pattern", &routes.static_pattern)?,
      font_re: compile("font_pattern", &routes.font_pattern)?,
      image_re: compile("image_pattern", &routes.image_pattern)?,
      api_re: compile("api_pattern", &routes.api_pattern)?,
      data_re: compile("data_pattern", &routes.data_pattern)?,
      page_prefixes: routes.page_prefixes.clone(),
    })
  }

  /// Classify a request. `None` means it is not intercepted at all.
  pub fn classify(&self, request: &Request) -> Option<Category> {
    self.classify_parts(request.url.scheme(), &request.method, request.url.path())
  }

  pub fn classify_parts(&self, scheme: &str, method: &str, path: &str) -> Option<Category> {
    if IGNORED_SCHEMES.contains(&scheme) || !matches!(scheme, "http" | "https") {
      return None;
    }

    if !method.eq_ignore_ascii_case("GET")
      || self
        .sensitive_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return Some(Category::NetworkOnly);
    }

    if self.static_re.is_match(path) {
      return Some(Category::Static);
    }
    if self.font_re.is_match(path) {
      return Some(Category::Fonts);
    }
    if self.image_re.is_match(path) {
      return Some(Category::Images);
    }
    if self.api_re.is_match(path) {
      return Some(Category::Api);
    }
    if self.data_re.is_match(path) {
      return Some(Category::Data);
    }

    // Known pages and the catch-all both resolve to Pages
    if !self.is_known_page(path) {
      trace!(path, "no route rule matched, using the page strategy");
    }
    Some(Category::Pages)
  }

  /// Whether the path is the root or one of the configured application pages.
  pub fn is_known_page(&self, path: &str) -> bool {
    path == "/"
      || self
        .page_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
  }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
  Regex::new(pattern).map_err(|e| eyre!("Invalid {} '{}': {}", name, pattern, e))
}
