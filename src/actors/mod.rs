//! Actors of the control plane
//!
//! Each actor runs as an independent task and is driven through a cloneable
//! handle that sends commands over an mpsc channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!   bus results ──┐
//!                 ▼
//!        CheckEngineHandle ──mpsc──► CheckEngineActor ──► CheckEngine
//!                 ▲                                          │
//!   callers ──────┘                                          ▼
//!                                                     AlertCoordinator
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the actor owns an mpsc command channel
//! 2. **Request/Response**: oneshot channels carry results back to the caller
//! 3. **Fire-and-forget**: bus-driven ingestion skips the reply channel

pub mod check_engine;
pub mod messages;

pub use check_engine::{CheckEngineActor, CheckEngineHandle};
pub use messages::EngineCommand;
