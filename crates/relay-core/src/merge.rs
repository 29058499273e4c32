//! Merge functions.
//!
//! A merge function reconciles a topic's current content with an incoming
//! payload. It must be deterministic and free of side effects; the store
//! relies on that to discard a failed merge without a trace.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Why a payload could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Payload is not UTF-8 text.
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Payload does not follow the merge function's format.
    #[error("Malformed payload at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// Payload rejected for any other reason.
    #[error("{0}")]
    Rejected(String),
}

/// Reconciles prior content with an incoming payload.
pub trait MergeFunction: Send + Sync {
    /// Produce the new content.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be applied to `current`.
    fn merge(&self, current: &str, payload: &[u8]) -> Result<String, MergeError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<F> MergeFunction for F
where
    F: Fn(&str, &[u8]) -> Result<String, MergeError> + Send + Sync,
{
    fn merge(&self, current: &str, payload: &[u8]) -> Result<String, MergeError> {
        self(current, payload)
    }
}

/// Last write wins: the payload replaces the content.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceMerge;

impl MergeFunction for ReplaceMerge {
    fn merge(&self, _current: &str, payload: &[u8]) -> Result<String, MergeError> {
        Ok(std::str::from_utf8(payload)?.to_owned())
    }

    fn name(&self) -> &'static str {
        "replace"
    }
}

/// Line patches as produced by the browser preview client.
///
/// Each payload line starting with `+` appends that line, each line starting
/// with `-` removes the first occurrence of that line. Blank lines are
/// skipped; anything else is malformed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinePatchMerge;

impl MergeFunction for LinePatchMerge {
    fn merge(&self, current: &str, payload: &[u8]) -> Result<String, MergeError> {
        let patch = std::str::from_utf8(payload)?;
        let mut content = current.to_owned();

        for (index, line) in patch.lines().enumerate() {
            if let Some(added) = line.strip_prefix('+') {
                content.push_str(added);
                content.push('\n');
            } else if let Some(removed) = line.strip_prefix('-') {
                let needle = format!("{removed}\n");
                if let Some(start) = content.find(&needle) {
                    content.replace_range(start..start + needle.len(), "");
                }
            } else if !line.is_empty() {
                return Err(MergeError::Malformed {
                    line: index + 1,
                    reason: "expected '+' or '-' prefix".to_string(),
                });
            }
        }

        Ok(content)
    }

    fn name(&self) -> &'static str {
        "line-patch"
    }
}

/// Built-in merge functions selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// [`ReplaceMerge`].
    #[default]
    Replace,
    /// [`LinePatchMerge`].
    LinePatch,
}

impl MergeStrategy {
    /// Instantiate the merge function.
    #[must_use]
    pub fn build(self) -> Arc<dyn MergeFunction> {
        match self {
            MergeStrategy::Replace => Arc::new(ReplaceMerge),
            MergeStrategy::LinePatch => Arc::new(LinePatchMerge),
        }
    }
}
