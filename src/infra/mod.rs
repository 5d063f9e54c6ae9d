//! Infrastructure layer for cross-cutting concerns.
//!
//! Provides foundational infrastructure including:
//! - Error handling and result types
//! - Configuration management and validation
//! - Storage of remembered lock-code secrets

pub mod config;
pub mod error;
pub mod secret_store;
