//! Tunables read from TOML.
//!
//! ```toml
//! [diff]
//! edit_cost = 4
//! max_diff_chars = 100000
//!
//! [preview]
//! max_chars = 64
//!
//! [legacy]
//! merge_chains = true
//! ```
//!
//! Every table and key is optional. A project file can be layered over a
//! user file with [`Config::layered`].

use serde::{
  Deserialize,
  Serialize,
};
use tale_core::DiffOptions;
use thiserror::Error;
use toml::Value;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid configuration: {0}")]
  BadConfig(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub diff:    DiffOptions,
  pub preview: PreviewOptions,
  pub legacy:  LegacyOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewOptions {
  /// Characters shown per redo preview before it is cut off.
  pub max_chars: usize,
}

impl Default for PreviewOptions {
  fn default() -> Self {
    Self { max_chars: 64 }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LegacyOptions {
  /// Fold a block that is its parent's only continuation into the parent's
  /// history node.
  pub merge_chains: bool,
}

impl Default for LegacyOptions {
  fn default() -> Self {
    Self { merge_chains: true }
  }
}

impl Config {
  pub fn from_toml_str(source: &str) -> Result<Self> {
    Ok(toml::from_str(source)?)
  }

  /// `local` overrides `global` key by key. Missing layers are skipped.
  pub fn layered(global: Option<&str>, local: Option<&str>) -> Result<Self> {
    let mut merged = Value::Table(toml::map::Map::new());
    for layer in [global, local].into_iter().flatten() {
      let value: Value = toml::from_str(layer)?;
      merged = merge_toml_values(merged, value, 2);
    }
    Ok(merged.try_into()?)
  }
}

/// Merges `right` into `left`, descending `merge_depth` tables deep.
fn merge_toml_values(left: Value, right: Value, merge_depth: usize) -> Value {
  match (left, right) {
    (Value::Table(mut left_map), Value::Table(right_map)) if merge_depth > 0 => {
      for (name, rvalue) in right_map {
        let merged = match left_map.remove(&name) {
          Some(lvalue) => merge_toml_values(lvalue, rvalue, merge_depth - 1),
          None => rvalue,
        };
        left_map.insert(name, merged);
      }
      Value::Table(left_map)
    },
    (_, value) => value,
  }
}
