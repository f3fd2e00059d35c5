//! inbox-agent: adaptive email action routing.
//!
//! Model judgments are normalized into a fixed action vocabulary, blended
//! with the user's historical behavior, and executed idempotently against
//! libSQL-backed queues.

pub mod behavior;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod source;
pub mod store;
