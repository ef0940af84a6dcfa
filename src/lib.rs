pub mod cli;
pub mod config;
pub mod conversation;
pub mod dataset;
pub mod services;
pub mod vector_store;

pub mod env;
pub mod error;
pub mod logging;

pub use config::AppConfig;
pub use error::{FaqBotError, Result};
pub use logging::{init_logging, LoggingConfig};
