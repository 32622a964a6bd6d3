//! API layer for schema-warden
//!
//! This module provides the facade that wires every component from one
//! configuration.

pub mod manager;

// Re-export main API types
pub use manager::{BootstrapReport, SchemaManager, load_migrations};
