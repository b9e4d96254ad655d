//! Money Jars Assistant
//!
//! A conversational financial assistant that:
//! - Lets a language model decide which money-jar tools to run
//! - Executes tool batches with per-call failure isolation
//! - Checkpoints every conversation thread after each step
//! - Streams each step to the client as it happens
//!
//! AGENT LOOP:
//! INPUT → REASON → (EXECUTE TOOLS → REASON)* → FINAL

pub mod agent;
pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod execution;
pub mod forecast;
pub mod ledger;
pub mod models;
pub mod reasoning;
pub mod state;
pub mod stream;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::Orchestrator;
pub use config::{LoopLimits, Settings};
pub use models::*;
pub use stream::StreamEvent;
