//! LLM provider implementations for inq.

pub mod gemini;

pub use gemini::GeminiProvider;
