//! HTTP request handlers.

pub mod config;
pub mod sessions;
pub mod trial;
pub mod turns;

pub use config::*;
pub use sessions::*;
pub use trial::*;
pub use turns::*;
