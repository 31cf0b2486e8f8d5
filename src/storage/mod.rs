//! Persistence boundary
//!
//! ## Design
//!
//! - **Trait-based**: [`Repository`] is all the control plane knows about storage
//! - **Async**: every call is async so a database-backed implementation fits
//! - **Atomic where it matters**: check results are swapped by version and alerts
//!   are inserted only if absent
//!
//! [`MemoryStore`] keeps everything in process and backs the tests and the hub's
//! local mode.

pub mod backend;
pub mod error;
pub mod memory;

pub use backend::Repository;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
