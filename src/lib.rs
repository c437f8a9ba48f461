pub mod types;
pub mod error;
pub mod config;
pub mod utils;
pub mod time;
pub mod client;
pub mod data;
pub mod db;

#[cfg(test)]
mod testutil;

pub use types::*;
pub use error::{BackfillError, Result};
