pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod logging;
pub mod logpath;
pub mod proxy;
pub mod record;
pub mod replay;
pub mod store;

pub use error::{Error, Result};
