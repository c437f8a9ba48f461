pub mod loader;

pub use loader::{load_config, resolve_api_key, validate_config};
