//! Gatekeeper
//!
//! Admission control for HTTP services. Each request is keyed by an identity
//! (client address, principal, or principal plus route) and checked against
//! either an in-process token bucket or a fixed-window counter kept in Redis
//! before the protected handler runs. Backend failures fail open.

pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod local;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod redis;
pub mod shared;
pub mod store;
pub mod sweeper;

// Re-export main types
pub use crate::config::Settings;
pub use crate::decision::Decision;
pub use crate::error::{GatekeeperError, Result};
pub use crate::limiter::{select_limiter, Limiter, LimiterOptions, SelectedLimiter};
pub use crate::local::LocalLimiterRegistry;
pub use crate::middleware::AdmissionLayer;
pub use crate::shared::SharedCounterLimiter;
