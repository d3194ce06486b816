//! turnstile-providers: provider adapters for turnstile
//!
//! Each adapter turns a vendor's streaming API into `NormalizedChunk`s with
//! ids that advance by one per chunk and exactly one final chunk per stream.

pub mod anthropic;
pub mod openai;
pub mod openai_compat;
pub mod openrouter;
pub mod stream;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use openai_compat::StreamTranslator;
pub use openrouter::OpenRouterAdapter;
pub use stream::ChunkIds;
