pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod usage_collector;

pub use error::{Error, Result};
