pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod sdk;
pub mod service;

pub use cache::{KeyBuilder, LocalCache, RedisCache, SharedCache};
pub use config::Config;
pub use error::{Error, Result};
