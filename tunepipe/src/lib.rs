//! tunepipe library crate.
//!
//! Audio streaming proxy built on external extractor and transcoder
//! processes.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod resolver;
pub mod tempfiles;

pub use error::{Error, Result};
