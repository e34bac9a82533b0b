pub mod capture;
pub mod config;
pub mod error;
pub mod manifest;
pub mod parser;
pub mod render;
pub mod resolver;
pub mod transcript;

pub use error::{CaptureError, Result};
