//! Configuration management for seqbus
//!
//! - Schema-driven configuration with validation
//! - Layered loading: defaults, TOML file, environment variables
//!
//! # Examples
//!
//! ```rust,no_run
//! use seqbus_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_path("/etc/seqbus")
//!     .load()
//!     .expect("Failed to load configuration");
//!
//! println!("dispatching with {}", config.dispatch.strategy);
//! ```

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::ConfigValidator;

use crate::Result;

/// Load configuration from the default search paths and environment
pub fn load_default() -> Result<SeqbusConfig> {
    ConfigLoader::new().load()
}
