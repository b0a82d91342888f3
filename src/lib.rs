//! Face indexing and query-by-photo search over a photo collection.
//!
//! Photos are deduplicated by content, every detected face is embedded and
//! assigned to a person cluster, and a query photo returns every indexed
//! photo of the same person ranked by embedding distance.

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod logging;
pub mod media;
pub mod scanner;
pub mod search;
pub mod service;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{FaceError, Result};
pub use service::{FaceFinder, HealthReport, ScanStatus};
