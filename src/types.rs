//! Core identifier types for the trellis workflow framework.
//!
//! Runs and steps are identified by UUIDv7 strings so that identifiers sort
//! by creation time and stay meaningful when forwarded across process
//! boundaries (log shippers, event sinks, replay tooling).
//!
//! # Key Types
//!
//! - [`RunId`]: identifies one top-level invocation of a workflow
//! - [`StepId`]: identifies one named sub-region of execution within a run
//!
//! # Examples
//!
//! ```rust
//! use trellis::types::{RunId, StepId};
//!
//! let run = RunId::new();
//! let step = StepId::new();
//! assert_ne!(run.as_str(), step.as_str());
//!
//! // Round-trip through the textual form
//! let revived = RunId::from(run.as_str());
//! assert_eq!(run, revived);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one top-level workflow run.
///
/// A `RunId` is allocated once by `start_run` (or supplied explicitly when
/// reviving a run) and copied onto every event the run emits. It is a
/// UUIDv7 in canonical textual form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Allocate a fresh, time-ordered run id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The textual UUID form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one step within a run.
///
/// Steps nest, forming a tree rooted at the run: every step records the id
/// of its parent step in the events it emits. Like [`RunId`], a `StepId` is
/// a UUIDv7 string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Allocate a fresh, time-ordered step id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The textual UUID form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
