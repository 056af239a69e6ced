// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Model capability seam.
//!
//! The agent driver is orchestration, not generation: it consumes a
//! [`ModelProvider`] that turns a prompt + tool surface into a finite,
//! single-shot, ordered stream of [`ModelEvent`]s. Concrete HTTP adapters
//! are collaborators outside this repository; the providers shipped here
//! are the deterministic mocks the test suite drives turns with.

pub mod mock;
pub mod provider;
pub mod types;

pub use mock::{FlakyProvider, MockProvider, ScriptedProvider};
pub use provider::{ModelProvider, ModelStream};
pub use types::{CompletionRequest, Message, ModelError, ModelEvent, Role, ToolSpec};
