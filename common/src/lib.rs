pub mod config;
pub mod logging;

pub use config::Config;

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;
