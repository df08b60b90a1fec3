//! vboxctl - client for a VirtualBox-style hypervisor management API.
//!
//! The library talks to a management server through a [`Transport`]: either
//! in-process against a [`vboxctl_sim::Platform`], or over HTTP against a
//! web-service endpoint such as the one started by `vboxctl serve`.
//!
//! All waiting is explicit and bounded: events are pulled by a passive
//! [`EventPoller`], long-running operations are polled by a
//! [`ProgressTracker`], and performance metrics are queried and decoded by a
//! [`MetricsCollector`].
//!
//! [`Transport`]: transport::Transport
//! [`EventPoller`]: events::EventPoller
//! [`ProgressTracker`]: progress::ProgressTracker
//! [`MetricsCollector`]: metrics::MetricsCollector

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod logs;
pub mod metrics;
pub mod objects;
pub mod ops;
pub mod progress;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::{Credentials, MachineSession, Session, SessionManager};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
