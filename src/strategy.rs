//! Caching strategies and the per-category policy registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{PolicyConfig, StrategiesConfig};
use crate::route::Category;

/// How a category's requests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

/// Immutable policy for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPolicy {
  pub kind: StrategyKind,
  pub max_age: Duration,
  pub max_entries: usize,
  pub network_timeout: Option<Duration>,
}

impl From<&PolicyConfig> for StrategyPolicy {
  fn from(config: &PolicyConfig) -> Self {
    Self {
      kind: config.strategy,
      max_age: Duration::from_secs(config.max_age_secs),
      max_entries: config.max_entries,
      network_timeout: config.network_timeout_ms.map(Duration::from_millis),
    }
  }
}

/// Network timeout used by network-first when a policy does not set one.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps every category to its policy.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
  policies: BTreeMap<Category, StrategyPolicy>,
}

impl StrategyRegistry {
  pub fn new(config: &StrategiesConfig) -> Self {
    let policies = Category::ALL
      .iter()
      .map(|category| {
        let policy = match category {
          Category::Static => &config.static_assets,
          Category::Images => &config.images,
          Category::Fonts => &config.fonts,
          Category::Api => &config.api,
          Category::Data => &config.data,
          Category::Pages => &config.pages,
          Category::NetworkOnly => &config.network_only,
        };
        (*category, StrategyPolicy::from(policy))
      })
      .collect();

    Self { policies }
  }

  pub fn policy(&self, category: Category) -> &StrategyPolicy {
    // Every category is inserted in `new`
    &self.policies[&category]
  }

  /// Look up a policy by its category name (e.g. "api").
  pub fn by_name(&self, name: &str) -> Option<(Category, &StrategyPolicy)> {
    self
      .policies
      .iter()
      .find(|(category, _)| category.as_str() == name)
      .map(|(category, policy)| (*category, policy))
  }
}
