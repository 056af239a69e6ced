// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{CompletionRequest, ModelError, ModelEvent};

/// A lazily produced, finite, ordered stream of model events.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

/// Capability interface the agent driver runs against.
///
/// Implementations must emit events in order and terminate every stream
/// with exactly one [`ModelEvent::Done`] (unless an error ends it first).
/// Streams are single-shot: they cannot be restarted or replayed.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display and logs.
    fn name(&self) -> &str;

    /// Start one completion round.
    ///
    /// An `Err` here is a request-level failure (classified transient or
    /// fatal); errors can also surface mid-stream as `Err` items.
    async fn stream(&self, req: CompletionRequest) -> Result<ModelStream, ModelError>;
}
