//! # Leadflow Core
//!
//! Shared vocabulary for the lead orchestration workers: the lead/flow data
//! model, the error taxonomy the lifecycle controller classifies, the TOML
//! configuration, and the traits every external collaborator sits behind.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::LeadflowConfig;
pub use error::{FailureClass, LeadflowError, RemoteError, RemoteErrorKind, Result};
pub use types::*;
