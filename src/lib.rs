//! vmhost: prepares, recreates and purges the host-side environment of a VM.
//!
//! A VM gets a network namespace with routed IPv6 and optional NATed IPv4,
//! SPDK-served (optionally encrypted) block devices exposed to the monitor
//! over vhost-user, a hugepage mount and systemd units. Everything that
//! needs root is issued through an [`executor::Executor`].

pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod net;
pub mod paths;
pub mod storage;
pub mod units;

pub use error::{Error, Result};
pub use lifecycle::Lifecycle;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
