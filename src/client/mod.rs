pub mod crypto;
pub mod fmp;
pub mod resilient;

pub use fmp::FmpClient;
pub use resilient::{ResilientClient, RetryPolicy};
