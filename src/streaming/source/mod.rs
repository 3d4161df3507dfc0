// Archiver data sources
//
// The `SampleSource` trait is the seam between the network layer and the
// consumers (monitor, block pump, spectrum processor). A `SubscriptionFactory`
// creates one source per run, so consumers can be tested against scripted
// sources and run against `FaServer` in production.
//
// Layers:
// - mask / codec: pure wire encoding
// - connection: exact-length reads over a byte stream
// - subscription: handshake and sample framing state machine
// - query: one-shot "C" commands

pub mod codec;
pub mod connection;
pub mod mask;
pub mod query;
pub mod subscription;

use crate::config::ServerConfig;
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;

pub use codec::SubscribeFlags;
pub use connection::StreamConnection;
pub use mask::{ChannelMask, MaskEncoding};
pub use query::{FaIdEntry, QueryCommand, ServerInfo, SnifferStatus};
pub use subscription::{Subscription, SubscriptionState};

/// A block of samples read from a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    /// `data[[n, c, axis]]`: sample n of mask column c, axis 0 = X, 1 = Y
    pub data: Array3<i32>,

    /// Sample counter of the first sample, when t0 was requested
    pub t0: Option<u32>,
}

impl SampleBlock {
    /// Number of samples in this block
    pub fn len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels (mask columns)
    pub fn channel_count(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    /// X/Y pairs of one column, or None if the column does not exist.
    pub fn channel(&self, column: usize) -> Option<Vec<[i32; 2]>> {
        if column >= self.channel_count() {
            return None;
        }
        Some(
            self.data
                .index_axis(Axis(1), column)
                .outer_iter()
                .map(|xy| [xy[0], xy[1]])
                .collect(),
        )
    }
}

/// Everything needed to open a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub mask: ChannelMask,

    #[serde(default)]
    pub encoding: MaskEncoding,

    #[serde(default)]
    pub flags: SubscribeFlags,
}

impl SubscribeRequest {
    pub fn new(mask: ChannelMask) -> Self {
        Self {
            mask,
            encoding: MaskEncoding::default(),
            flags: SubscribeFlags::default(),
        }
    }

    pub fn decimated(mut self, decimated: bool) -> Self {
        self.flags.decimated = decimated;
        self
    }

    pub fn with_t0(mut self) -> Self {
        self.flags.t0 = true;
        self
    }

    pub fn uncork(mut self, uncork: bool) -> Self {
        self.flags.uncork = uncork;
        self
    }

    pub fn encoding(mut self, encoding: MaskEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// A stream of sample blocks for a fixed mask
#[async_trait]
pub trait SampleSource: Send {
    /// Read exactly `samples` samples for every channel in the mask
    async fn read(&mut self, samples: usize) -> StreamResult<SampleBlock>;

    /// Release the underlying connection. Idempotent.
    async fn close(&mut self);

    /// Mask this source was opened with
    fn mask(&self) -> &ChannelMask;

    /// Counter of the next sample to be read, when known
    fn t0(&self) -> Option<u32>;
}

/// Opens sample sources on demand
///
/// Consumers hold an `Arc<dyn SubscriptionFactory>` and call `subscribe` once
/// per run, which makes reconnecting a matter of calling it again.
#[async_trait]
pub trait SubscriptionFactory: Send + Sync {
    async fn subscribe(&self, request: &SubscribeRequest) -> StreamResult<Box<dyn SampleSource>>;
}

/// Client handle for one archiver server
pub struct FaServer {
    config: ServerConfig,
    info: OnceCell<ServerInfo>,
}

impl FaServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            info: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn connect(&self) -> StreamResult<StreamConnection<TcpStream>> {
        StreamConnection::connect(self.config.address(), self.config.connect_timeout()).await
    }

    /// Sends one query command line and returns the complete reply.
    ///
    /// The server closes the connection after answering, so the reply is
    /// everything received up to EOF.
    pub async fn query(&self, commands: &[QueryCommand]) -> StreamResult<String> {
        let mut connection = self.connect().await?;
        connection.send(&query::build_query(commands)).await?;
        let reply = connection.recv_to_end(self.config.read_timeout()).await;
        connection.shutdown().await;
        Ok(String::from_utf8_lossy(&reply?).into_owned())
    }

    /// Sample frequency, live decimation and id count, fetched once.
    pub async fn server_info(&self) -> StreamResult<&ServerInfo> {
        self.info
            .get_or_try_init(|| async {
                let reply = self.query(ServerInfo::COMMANDS).await?;
                let info = ServerInfo::parse(&reply)?;
                log::info!(
                    "Archiver {}: {} Hz, decimation {}, {} ids",
                    self.config.address(),
                    info.sample_frequency,
                    info.decimation,
                    info.fa_id_count
                );
                Ok::<_, StreamError>(info)
            })
            .await
    }

    pub async fn sample_frequency(&self) -> StreamResult<f64> {
        query::parse_float(&self.query(&[QueryCommand::SampleFrequency]).await?)
    }

    pub async fn decimation(&self) -> StreamResult<u32> {
        query::parse_int(&self.query(&[QueryCommand::LiveDecimation]).await?)
    }

    pub async fn status(&self) -> StreamResult<SnifferStatus> {
        SnifferStatus::parse(&self.query(&[QueryCommand::Status]).await?)
    }

    pub async fn fa_ids(&self) -> StreamResult<Vec<FaIdEntry>> {
        query::parse_fa_ids(&self.query(&[QueryCommand::FaIdList]).await?)
    }

    /// Opens a subscription. Decimated streams advance t0 by the server's
    /// live decimation factor per sample.
    pub async fn subscribe(&self, request: &SubscribeRequest) -> StreamResult<Subscription<TcpStream>> {
        let decimation_factor = if request.flags.decimated {
            self.server_info().await?.decimation
        } else {
            1
        };
        if decimation_factor == 0 {
            return Err(StreamError::Protocol(
                "server reports no live decimation".to_string(),
            ));
        }

        let connection = self.connect().await?;
        Subscription::open(
            connection,
            request,
            decimation_factor,
            self.config.read_timeout(),
        )
        .await
    }
}

#[async_trait]
impl SubscriptionFactory for FaServer {
    async fn subscribe(&self, request: &SubscribeRequest) -> StreamResult<Box<dyn SampleSource>> {
        let subscription = FaServer::subscribe(self, request).await?;
        Ok(Box::new(subscription))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_block_channel() {
        let data = Array3::from_shape_fn((3, 2, 2), |(n, c, axis)| {
            (n * 10 + c) as i32 * if axis == 0 { 1 } else { -1 }
        });
        let block = SampleBlock { data, t0: Some(7) };

        assert_eq!(block.len(), 3);
        assert_eq!(block.channel_count(), 2);
        assert_eq!(
            block.channel(1).unwrap(),
            vec![[1, -1], [11, -11], [21, -21]]
        );
        assert!(block.channel(2).is_none());
    }

    #[test]
    fn test_subscribe_request_builder() {
        let request = SubscribeRequest::new(ChannelMask::single(4))
            .decimated(true)
            .with_t0()
            .encoding(MaskEncoding::Hex);
        assert!(request.flags.decimated);
        assert!(request.flags.t0);
        assert!(!request.flags.uncork);
        assert_eq!(request.encoding, MaskEncoding::Hex);
    }

    #[tokio::test]
    async fn test_server_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = FaServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 500,
            read_timeout_ms: 500,
        });
        let err = server
            .subscribe(&SubscribeRequest::new(ChannelMask::single(1)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Connect(_)));
    }
}
