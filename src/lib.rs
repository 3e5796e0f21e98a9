//! calculation-member: event stream client for the calculation-dispatch platform
//!
//! Keeps a single persistent stream to the platform, performs the
//! join/greet handshake before the stream is used, correlates outbound
//! events with their acknowledgments, watches keep-alives and reconnects
//! with capped exponential backoff when the stream fails.
//!
//! Business logic plugs in as [`stream::EventHandler`]s.

pub mod config;
pub mod error;
pub mod stream;

pub use config::Config;
pub use error::{ClientError, Result};
pub use stream::{ConnectionManager, ManagerConfig};
