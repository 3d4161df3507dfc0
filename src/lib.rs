//! Client for the FA archiver live data stream.
//!
//! [`streaming::FaServer`] opens subscriptions and answers query commands,
//! [`streaming::StreamMonitor`] keeps a rolling window of one channel, and
//! [`streaming::SpectrumProcessor`] maintains a running power spectrum.

pub mod config;
pub mod streaming;

pub use config::{ConfigError, MonitorConfig, ServerConfig, SpectrumSettings};
pub use streaming::{StreamError, StreamResult};
