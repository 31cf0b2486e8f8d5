pub mod actors;
pub mod alerts;
pub mod bulk;
pub mod checks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod models;
pub mod notify;
pub mod queue;
pub mod storage;
pub mod util;

pub use error::CommandError;
