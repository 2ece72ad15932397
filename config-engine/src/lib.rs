//! Configuration loading for the ReBAC engine workspace
//! 
//! Sources are merged in priority order:
//! 
//! - **Defaults**: the `Default` impl of the target type
//! - **Local File**: YAML or TOML, picked by extension
//! - **Environment Variables**: `REBAC_` prefix, `__` separates nested keys
//!   (`REBAC_ENGINE__MAX_DEPTH=40`)
//! 
//! # Example
//! 
//! ```rust,no_run
//! use config_engine::ConfigLoader;
//! use serde::{Deserialize, Serialize};
//! 
//! #[derive(Default, Serialize, Deserialize)]
//! struct AppConfig {
//!     database_url: Option<String>,
//!     log_level: String,
//! }
//! 
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: AppConfig = ConfigLoader::new()
//!         .with_file("rebac.yaml")
//!         .load()?;
//!     println!("log level: {}", config.log_level);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod loader;

pub use error::*;
pub use loader::*;
