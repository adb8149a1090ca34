//! Queue configuration: concurrency limits and per-entry options.
//!
//! Everything here is plain data with [`serde`] support so a host application
//! can load queue settings from the same JSON documents it already parses.

use std::fmt;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading a [`QueueConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid queue configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Upper bound on the number of tasks running at once.
///
/// Serialized as an optional integer: `null`, an absent field or `0` all mean
/// [`Limit::Unbounded`].
///
/// # Examples
///
/// ```
/// use boundq::config::Limit;
///
/// assert_eq!(Limit::from(0), Limit::Unbounded);
/// assert_eq!(Limit::from(3).get(), Some(3));
/// assert!(Limit::from(2).admits(1));
/// assert!(!Limit::from(2).admits(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum Limit {
    /// Any number of tasks may run.
    #[default]
    Unbounded,

    /// At most this many tasks may run.
    Max(NonZeroUsize),
}

impl Limit {
    /// Returns the numeric bound, or `None` when unbounded.
    pub fn get(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Max(max) => Some(max.get()),
        }
    }

    /// Returns `true` if one more task may start while `running` are active.
    pub fn admits(self, running: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Max(max) => running < max.get(),
        }
    }
}

impl From<usize> for Limit {
    fn from(value: usize) -> Self {
        NonZeroUsize::new(value).map(Limit::Max).unwrap_or(Limit::Unbounded)
    }
}

impl From<Option<usize>> for Limit {
    fn from(value: Option<usize>) -> Self {
        value.map(Limit::from).unwrap_or_default()
    }
}

impl From<Limit> for Option<usize> {
    fn from(limit: Limit) -> Self {
        limit.get()
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Max(max) => write!(f, "{max}"),
        }
    }
}

/// Settings applied when a queue is constructed.
///
/// # Examples
///
/// ```
/// use boundq::config::{Limit, QueueConfig};
///
/// let config = QueueConfig::from_json_str(r#"{ "limit": 4 }"#).unwrap();
/// assert_eq!(config.limit, Limit::from(4));
///
/// let config = QueueConfig::from_json_str("{}").unwrap();
/// assert_eq!(config.limit, Limit::Unbounded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of simultaneously running tasks.
    pub limit: Limit,
}

impl QueueConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if `input` is not valid JSON or does not
    /// match the expected shape.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(input)?)
    }
}

/// Per-entry options accepted by [`TaskQueue::add_with`](crate::TaskQueue::add_with).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddOptions {
    /// Deduplication key. While an entry with this id is still waiting in the
    /// backlog, further entries with the same id are ignored.
    pub id: Option<String>,
}

impl AddOptions {
    /// Options carrying an explicit deduplication id. An empty id counts as
    /// no id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: (!id.is_empty()).then_some(id),
        }
    }

    /// Lenient conversion from loosely-typed input.
    ///
    /// Anything that is not an object, or whose `id` is not a string, is
    /// treated as if no options had been given.
    ///
    /// ```
    /// use boundq::config::AddOptions;
    /// use serde_json::json;
    ///
    /// assert_eq!(AddOptions::from_json(&json!({ "id": "x" })), AddOptions::with_id("x"));
    /// assert_eq!(AddOptions::from_json(&json!("x")), AddOptions::default());
    /// assert_eq!(AddOptions::from_json(&json!({ "id": 7 })), AddOptions::default());
    /// ```
    pub fn from_json(value: &serde_json::Value) -> Self {
        let id = value
            .as_object()
            .and_then(|map| map.get("id"))
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        Self { id }
    }
}

impl From<&str> for AddOptions {
    fn from(id: &str) -> Self {
        Self::with_id(id)
    }
}

impl From<String> for AddOptions {
    fn from(id: String) -> Self {
        Self::with_id(id)
    }
}
