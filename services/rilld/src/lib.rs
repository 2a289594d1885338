//! Broker daemon library crate.
//!
//! # Purpose
//! Exposes the daemon subsystems (config, server shell, control-stream and
//! connection handling, frame I/O) for use by the binary and the integration
//! tests.
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod observability;
pub mod server;
