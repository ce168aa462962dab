pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::CalderaConfig;
pub use error::{Error, Result};
