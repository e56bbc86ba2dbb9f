pub mod types;
pub mod error;
pub mod config;
pub mod data;
pub mod broker;
pub mod strategy;
pub mod time;
pub mod utils;

pub use types::*;
pub use error::{Result, SyncError};
