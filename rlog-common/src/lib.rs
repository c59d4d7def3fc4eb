// Shared identity types, configuration and errors for the replicated log
pub mod config;
pub mod error;
pub mod types;
