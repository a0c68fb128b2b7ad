//!
//! Payflow Gateway - outbound I/O for the Payflow engine
//!
//! HTTP implementations of the engine's ports: the transfer gateway
//! behind API_CALL, TSQ, and reversal dispatch, and the caller
//! notifier that delivers result callbacks, plus the settings loader
//! wiring them together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// HTTP transfer gateway
pub mod client;

/// Settings
pub mod config;

/// Result-callback delivery
pub mod notify;

pub use client::HttpTransferGateway;
pub use config::GatewaySettings;
pub use notify::HttpCallerNotifier;
