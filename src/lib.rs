pub mod backends;
pub mod config;
pub mod error;
pub mod executor;
pub mod harvest;
pub mod logging;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use config::{CollectorArgs, CollectorConfig};
pub use error::{CollectorError, ConfigError};
pub use executor::*;
pub use model::*;
pub use traits::*;
