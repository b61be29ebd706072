//! Mirador CLI - command-line interface for the Mirador listings mirror.
//!
//! This crate wires the PostgreSQL store and the upstream client into the
//! sync engine and exposes it as the `mirador` binary.

pub mod config;

pub use config::{Command, Config, LogLevel};
