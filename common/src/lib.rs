pub mod configuration;
pub mod logging;
pub mod utility;

pub use configuration::{Config, ConfigError};
pub use utility::parse_configuration;
