pub mod atomic_file;
pub mod rate_limiter;

pub use atomic_file::write_json_atomic;
pub use rate_limiter::RateLimiter;
