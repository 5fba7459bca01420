// Core types and functionality for the Stagehand node execution engine

pub mod types;
pub mod error;
pub mod ambiance;
pub mod storage;
pub mod cache;
pub mod expression;
pub mod facilitator;
pub mod adviser;
pub mod events;
pub mod notify;
pub mod dispatcher;
pub mod stage;
pub mod governance;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{EngineError, EngineResult};
pub use types::*;
