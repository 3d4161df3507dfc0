// Live data subscription
//
// Created -> Handshaking -> Streaming -> Closed. A failed handshake goes
// straight to Closed. Reads are only valid while Streaming.

use super::codec::{self, SubscribeFlags};
use super::connection::StreamConnection;
use super::mask::ChannelMask;
use super::{SampleBlock, SampleSource, SubscribeRequest};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Handshaking,
    Streaming,
    Closed,
}

pub struct Subscription<S> {
    connection: Option<StreamConnection<S>>,
    state: SubscriptionState,
    mask: ChannelMask,
    flags: SubscribeFlags,
    decimation_factor: u32,
    read_timeout: Duration,
    t0: Option<u32>,
    timestamp: Option<u64>,
}

impl<S> Subscription<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Performs the subscribe handshake on `connection`.
    ///
    /// `decimation_factor` is the number of full rate samples per delivered
    /// sample; it only affects how t0 advances.
    pub async fn open(
        connection: StreamConnection<S>,
        request: &SubscribeRequest,
        decimation_factor: u32,
        read_timeout: Duration,
    ) -> StreamResult<Self> {
        if decimation_factor == 0 {
            return Err(StreamError::InvalidConfig(
                "decimation factor must be at least 1".to_string(),
            ));
        }

        let mut subscription = Self {
            connection: Some(connection),
            state: SubscriptionState::Created,
            mask: request.mask.clone(),
            flags: request.flags,
            decimation_factor,
            read_timeout,
            t0: None,
            timestamp: None,
        };

        match subscription.handshake(request).await {
            Ok(()) => Ok(subscription),
            Err(e) => {
                subscription.close_connection().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, request: &SubscribeRequest) -> StreamResult<()> {
        self.state = SubscriptionState::Handshaking;
        let timeout = self.read_timeout;
        let command = codec::build_subscribe_command(&request.mask, request.encoding, request.flags);
        let connection = self.connection.as_mut().ok_or(StreamError::Closed)?;

        log::debug!(
            "Subscribing to {} ids on {}: {:?}",
            request.mask.count(),
            connection.peer(),
            String::from_utf8_lossy(&command).trim_end()
        );
        connection.send(&command).await?;

        let status = connection.recv_exact(1, timeout).await?;
        if status[0] != 0 {
            let rest = match connection.recv_line(timeout).await {
                Ok(line) => line,
                // Whatever arrived before the close is still the message
                Err(StreamError::Eof) => match connection.recv_to_end(timeout).await {
                    Ok(rest) => rest,
                    Err(e) => {
                        log::debug!("Rejection message unreadable: {}", e);
                        Bytes::new()
                    }
                },
                Err(e) => return Err(e),
            };
            let mut response = status.to_vec();
            response.extend_from_slice(&rest);
            codec::decode_handshake(&response)?;
        }

        if request.flags.timestamp {
            let bytes = connection.recv_exact(codec::TIMESTAMP_LEN, timeout).await?;
            self.timestamp = Some(codec::decode_timestamp(&bytes)?);
        }
        if request.flags.t0 {
            let bytes = connection.recv_exact(codec::T0_LEN, timeout).await?;
            self.t0 = Some(codec::decode_t0(&bytes)?);
        }

        self.state = SubscriptionState::Streaming;
        Ok(())
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn flags(&self) -> SubscribeFlags {
        self.flags
    }

    pub fn decimation_factor(&self) -> u32 {
        self.decimation_factor
    }

    /// Start timestamp in microseconds, when requested
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Reads exactly `samples` samples for every subscribed channel.
    pub async fn read(&mut self, samples: usize) -> StreamResult<SampleBlock> {
        if self.state != SubscriptionState::Streaming {
            return Err(StreamError::Closed);
        }
        let connection = self.connection.as_mut().ok_or(StreamError::Closed)?;

        let count = self.mask.count();
        let bytes = connection
            .recv_exact(codec::frame_len(samples, count), self.read_timeout)
            .await?;
        let data = codec::decode_samples(&bytes, samples, count)?;

        let t0 = self.t0;
        if let Some(current) = self.t0 {
            let advance = (samples as u64).wrapping_mul(u64::from(self.decimation_factor));
            self.t0 = Some(current.wrapping_add(advance as u32));
        }

        Ok(SampleBlock { data, t0 })
    }

    /// Idempotent; releases the connection.
    pub async fn close(&mut self) {
        if self.state != SubscriptionState::Closed {
            log::debug!("Closing subscription for {} ids", self.mask.count());
        }
        self.close_connection().await;
    }

    async fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
        self.state = SubscriptionState::Closed;
    }
}

#[async_trait]
impl<S> SampleSource for Subscription<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, samples: usize) -> StreamResult<SampleBlock> {
        Subscription::read(self, samples).await
    }

    async fn close(&mut self) {
        Subscription::close(self).await
    }

    fn mask(&self) -> &ChannelMask {
        &self.mask
    }

    fn t0(&self) -> Option<u32> {
        self.t0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::mask::MaskEncoding;
    use crate::streaming::source::testing::ScriptedStream;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn request(ids: &[u32], flags: SubscribeFlags) -> SubscribeRequest {
        SubscribeRequest {
            mask: ChannelMask::new(ids.iter().copied()).unwrap(),
            encoding: MaskEncoding::RangeList,
            flags,
        }
    }

    fn frames(samples: usize, channels: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for n in 0..samples {
            for c in 0..channels {
                bytes.extend_from_slice(&((n * 10 + c) as i32).to_le_bytes());
                bytes.extend_from_slice(&(-((n * 10 + c) as i32)).to_le_bytes());
            }
        }
        bytes
    }

    #[tokio::test]
    async fn test_handshake_and_read() {
        let mut reply = vec![0u8];
        reply.extend(frames(4, 2));
        let conn = StreamConnection::new(ScriptedStream::new(vec![reply]));

        let mut sub = Subscription::open(conn, &request(&[7, 3], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(sub.state(), SubscriptionState::Streaming);
        assert_eq!(sub.t0, None);

        let block = sub.read(4).await.unwrap();
        assert_eq!(block.data.shape(), &[4, 2, 2]);
        assert_eq!(block.data[[3, 1, 0]], 31);
        assert_eq!(block.data[[3, 1, 1]], -31);
        assert_eq!(block.t0, None);

        let sent = sub.connection.as_ref().unwrap().get_ref().written().to_vec();
        assert_eq!(sent, b"S3,7\n");
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let conn = StreamConnection::new(ScriptedStream::new(vec![vec![1], b"bad mask\n".to_vec()]));
        let err = Subscription::open(conn, &request(&[5], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Protocol(ref m) if m == "bad mask"));
    }

    #[tokio::test]
    async fn test_handshake_rejected_without_newline() {
        // Server closes straight after an unterminated message
        let conn = StreamConnection::new(ScriptedStream::new(vec![vec![1], b"bad mask".to_vec()]));
        let err = Subscription::open(conn, &request(&[5], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Protocol(ref m) if m == "bad mask"));

        let conn = StreamConnection::new(ScriptedStream::new(vec![vec![3]]));
        let err = Subscription::open(conn, &request(&[5], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, StreamError::Protocol(ref m) if m == "subscription rejected with status 3")
        );
    }

    #[tokio::test]
    async fn test_t0_and_timestamp_headers() {
        let mut reply = vec![0u8];
        reply.extend_from_slice(&123_456u64.to_le_bytes());
        reply.extend_from_slice(&(u32::MAX - 5).to_le_bytes());
        reply.extend(frames(3, 1));
        let flags = SubscribeFlags {
            timestamp: true,
            t0: true,
            ..Default::default()
        };
        let conn = StreamConnection::new(ScriptedStream::new(vec![reply]));
        let mut sub = Subscription::open(conn, &request(&[1], flags), 4, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(sub.timestamp(), Some(123_456));
        assert_eq!(SampleSource::t0(&sub), Some(u32::MAX - 5));

        let block = sub.read(3).await.unwrap();
        assert_eq!(block.t0, Some(u32::MAX - 5));
        // 3 samples x decimation 4 wraps past 2^32
        assert_eq!(SampleSource::t0(&sub), Some(6));
    }

    #[tokio::test]
    async fn test_t0_advance_property() {
        for decimation in [1u32, 2, 10, 64, 1 << 20] {
            for samples in [0usize, 1, 17, 1000, 4096] {
                let mut reply = vec![0u8];
                reply.extend_from_slice(&0xfff0_0000u32.to_le_bytes());
                reply.extend(frames(samples, 1));
                let flags = SubscribeFlags {
                    t0: true,
                    ..Default::default()
                };
                let conn = StreamConnection::new(ScriptedStream::new(vec![reply]));
                let mut sub = Subscription::open(conn, &request(&[2], flags), decimation, TIMEOUT)
                    .await
                    .unwrap();
                sub.read(samples).await.unwrap();

                let expected = ((0xfff0_0000u64 + samples as u64 * decimation as u64)
                    % (1u64 << 32)) as u32;
                assert_eq!(SampleSource::t0(&sub), Some(expected));
            }
        }
    }

    #[tokio::test]
    async fn test_read_after_close() {
        let conn = StreamConnection::new(ScriptedStream::new(vec![vec![0]]));
        let mut sub = Subscription::open(conn, &request(&[1], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .unwrap();
        sub.close().await;
        sub.close().await;
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert!(matches!(sub.read(1).await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_read_eof_mid_frame() {
        let mut reply = vec![0u8];
        reply.extend(&frames(2, 1)[..12]);
        let conn = StreamConnection::new(ScriptedStream::new(vec![reply]));
        let mut sub = Subscription::open(conn, &request(&[1], SubscribeFlags::default()), 1, TIMEOUT)
            .await
            .unwrap();
        assert!(matches!(sub.read(2).await, Err(StreamError::Eof)));
    }

    #[tokio::test]
    async fn test_zero_decimation_rejected() {
        let conn = StreamConnection::new(ScriptedStream::new(vec![vec![0]]));
        let result = Subscription::open(conn, &request(&[1], SubscribeFlags::default()), 0, TIMEOUT).await;
        assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
    }
}
