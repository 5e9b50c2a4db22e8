//! Shared mocks and fixtures for Strand tests.

pub mod fixtures;
pub mod llm;
pub mod services;

pub use fixtures::*;
pub use llm::ScriptedLlm;
pub use services::*;
