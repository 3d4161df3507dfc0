// FA archiver streaming
//
// This module connects to an FA archiver, subscribes to live beam position
// data and turns the stream into rolling windows and running spectra.
//
// Architecture:
// - `source`: wire protocol, connections, subscriptions and query commands
// - `buffer`: rolling sample window and the bounded drop-on-overflow queue
// - `controller`: single channel monitor and block pump lifecycles
// - `processor`: overlap windowed power spectrum and running mean
// - `types`: errors, monitor state and reconnect policy

pub mod buffer;
pub mod controller;
pub mod processor;
pub mod source;
pub mod types;

pub use buffer::{BlockQueue, OverflowStrategy, QueueMetrics, RollingBuffer};
pub use controller::{BlockPump, MonitorCallbacks, StreamMonitor};
pub use processor::{
    RunningMean, Spectrum, SpectrumConfig, SpectrumControl, SpectrumEstimator, SpectrumProcessor,
};
pub use source::{
    ChannelMask, FaServer, MaskEncoding, SampleBlock, SampleSource, SubscribeFlags,
    SubscribeRequest, Subscription, SubscriptionFactory,
};
pub use types::{MonitorState, MonitorStats, ReconnectPolicy, StreamError, StreamResult};
