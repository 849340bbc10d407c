//! Language-model boundary for TrustTable.
//!
//! The audit pipeline treats the model as an opaque text-completion
//! service: every stage builds a [`CompletionRequest`] tagged with its
//! [`PromptPurpose`] and sends it through a [`LanguageModel`].

pub mod client;
pub mod error;
pub mod fakes;
pub mod model;

pub use client::{ChatCompletionsClient, ModelConfig};
pub use error::{ModelError, Result};
pub use fakes::{Scripted, ScriptedModel};
pub use model::{strip_code_fences, CompletionRequest, LanguageModel, PromptPurpose};
