//! Request-side value types: [`TaskSpec`], [`TaskKind`], [`ChannelId`], [`Category`].

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Free-form text generation.
    Generation,
    /// Reading and analysing existing material.
    Analysis,
    /// Assigning labels to an input.
    Classification,
    /// Producing vector embeddings.
    Embedding,
    /// Writing, reviewing or fixing code.
    Coding,
    /// Multi-step reasoning and planning.
    Reasoning,
    /// Condensing longer input.
    Summarization,
}

/// Immutable description of one unit of work.
///
/// Created once per request by the caller and never mutated; the builder
/// methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What kind of work this is.
    pub kind: TaskKind,
    /// Maximum acceptable latency in milliseconds.
    pub max_latency_ms: u64,
    /// Estimated context size in tokens.
    pub context_tokens: u64,
    /// Whether the task favours creative output.
    pub creative: bool,
    /// Whether the task demands the strongest available quality.
    pub strict_quality: bool,
}

impl TaskSpec {
    /// Create a task with the given kind and a relaxed 60 s latency bound.
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            max_latency_ms: 60_000,
            context_tokens: 0,
            creative: false,
            strict_quality: false,
        }
    }

    /// Set the latency bound.
    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = ms;
        self
    }

    /// Set the estimated context size.
    pub fn with_context_tokens(mut self, tokens: u64) -> Self {
        self.context_tokens = tokens;
        self
    }

    /// Set the `creative` flag.
    pub fn creative(mut self, creative: bool) -> Self {
        self.creative = creative;
        self
    }

    /// Set the `strict_quality` flag.
    pub fn strict_quality(mut self, strict: bool) -> Self {
        self.strict_quality = strict;
        self
    }
}

/// Identifier of a routable backend channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(
    /// The configured channel id.
    pub String,
);

impl ChannelId {
    /// Create a [`ChannelId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A routing bucket selecting which channel chain is considered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(
    /// The configured category name.
    pub String,
);

impl Category {
    /// Create a [`Category`] from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Return the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
