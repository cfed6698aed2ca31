//! Warden - resource-pressure control and failure recovery for an embedded
//! analytical engine
//!
//! This crate wires the pieces together:
//! - [`Warden`]: the supervisor facade and its periodic loops
//! - [`telemetry`]: tracing subscriber setup
//! - [`commands`]: operator commands used by the `warden` binary
//!
//! # Example
//!
//! ```rust,ignore
//! use warden::Warden;
//! use warden_core::{OperationClass, WardenConfig};
//!
//! let warden = Warden::builder(WardenConfig::load("warden.toml")?, engine)
//!     .with_connector(connector)
//!     .build()?;
//! let loops = warden.start();
//! let rows = warden.execute("SELECT * FROM orders", OperationClass::Simple).await?;
//! loops.shutdown().await;
//! ```

#![warn(unreachable_pub)]

pub mod commands;
pub mod supervisor;
pub mod telemetry;

pub use supervisor::{Warden, WardenBuilder, WardenHandle};
pub use telemetry::{init_tracing, LogFormat};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
