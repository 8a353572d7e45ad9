//! LLM integration for bugforge.
//!
//! Provides a LiteLLM-compatible chat client behind the [`LlmProvider`]
//! trait. The injector and solver agents only depend on the trait, so tests
//! swap in deterministic stubs and the core never learns which provider is
//! behind the contract.

pub mod client;

pub use client::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
