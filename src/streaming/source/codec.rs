// Wire codec for the archiver subscription protocol
//
// subscription = "S" mask flags "\n"
// mask         = range-list | "R" hex-mask
// flags        = [ "T" ] [ "Z" ] [ "U" ] [ "D" ]
//
// The server answers with one status byte: 0 means the stream follows,
// anything else starts a newline-terminated error message. On success the
// optional start timestamp (u64) and t0 (u32) precede the sample frames, all
// little-endian. Each frame is channel_count X/Y pairs of i32.

use super::mask::{ChannelMask, MaskEncoding};
use crate::streaming::types::{StreamError, StreamResult};
use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Bytes per sample per channel: 2 axes of i32
pub const BYTES_PER_CHANNEL_SAMPLE: usize = 8;

/// Size of the optional t0 header
pub const T0_LEN: usize = 4;

/// Size of the optional start timestamp header
pub const TIMESTAMP_LEN: usize = 8;

/// Option letters appended to a subscribe command
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeFlags {
    /// `T`: send the start timestamp
    #[serde(default)]
    pub timestamp: bool,

    /// `Z`: send the initial sample counter
    #[serde(default)]
    pub t0: bool,

    /// `U`: disable Nagle buffering on the server side
    #[serde(default)]
    pub uncork: bool,

    /// `D`: decimated stream
    #[serde(default)]
    pub decimated: bool,
}

impl SubscribeFlags {
    /// Flags in the order the server parses them.
    pub fn to_flag_string(&self) -> String {
        let mut flags = String::with_capacity(4);
        for (set, letter) in [
            (self.timestamp, 'T'),
            (self.t0, 'Z'),
            (self.uncork, 'U'),
            (self.decimated, 'D'),
        ] {
            if set {
                flags.push(letter);
            }
        }
        flags
    }

    /// Number of header bytes the server sends after a successful handshake
    pub fn header_len(&self) -> usize {
        let mut len = 0;
        if self.timestamp {
            len += TIMESTAMP_LEN;
        }
        if self.t0 {
            len += T0_LEN;
        }
        len
    }
}

/// Builds the full subscribe command line.
pub fn build_subscribe_command(
    mask: &ChannelMask,
    encoding: MaskEncoding,
    flags: SubscribeFlags,
) -> Vec<u8> {
    let (_, encoded) = mask.encode(encoding);
    let prefix = match encoding {
        MaskEncoding::RangeList => "S",
        MaskEncoding::Hex => "SR",
    };
    format!("{}{}{}\n", prefix, encoded, flags.to_flag_string()).into_bytes()
}

/// Interprets a handshake reply: the status byte followed, on failure, by the
/// rest of the error line.
pub fn decode_handshake(response: &[u8]) -> StreamResult<()> {
    match response.first() {
        None => Err(StreamError::Protocol(
            "empty handshake response".to_string(),
        )),
        Some(0) => Ok(()),
        Some(_) => {
            let text = String::from_utf8_lossy(response);
            let message = text
                .strip_suffix('\n')
                .unwrap_or(&text)
                .trim_start_matches(|c: char| c.is_control())
                .to_string();
            if message.is_empty() {
                Err(StreamError::Protocol(format!(
                    "subscription rejected with status {}",
                    response[0]
                )))
            } else {
                Err(StreamError::Protocol(message))
            }
        }
    }
}

/// Reshapes a raw frame buffer into [samples, channel_count, 2].
pub fn decode_samples(
    bytes: &[u8],
    samples: usize,
    channel_count: usize,
) -> StreamResult<Array3<i32>> {
    let expected = frame_len(samples, channel_count);
    if bytes.len() != expected {
        return Err(StreamError::Protocol(format!(
            "expected {} bytes of sample data, got {}",
            expected,
            bytes.len()
        )));
    }

    let mut values = vec![0i32; samples * channel_count * 2];
    LittleEndian::read_i32_into(bytes, &mut values);
    Array3::from_shape_vec((samples, channel_count, 2), values)
        .map_err(|e| StreamError::Protocol(format!("bad sample shape: {}", e)))
}

/// Bytes needed for `samples` frames of `channel_count` channels
pub fn frame_len(samples: usize, channel_count: usize) -> usize {
    BYTES_PER_CHANNEL_SAMPLE * samples * channel_count
}

pub fn decode_t0(bytes: &[u8]) -> StreamResult<u32> {
    if bytes.len() != T0_LEN {
        return Err(StreamError::Protocol(format!(
            "t0 header must be {} bytes, got {}",
            T0_LEN,
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_u32(bytes))
}

pub fn decode_timestamp(bytes: &[u8]) -> StreamResult<u64> {
    if bytes.len() != TIMESTAMP_LEN {
        return Err(StreamError::Protocol(format!(
            "timestamp header must be {} bytes, got {}",
            TIMESTAMP_LEN,
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_u64(bytes))
}

/// Encodes sample values the way the server sends them.
pub fn encode_samples(samples: &Array3<i32>) -> Vec<u8> {
    let values: Vec<i32> = samples.iter().copied().collect();
    let mut bytes = vec![0u8; values.len() * 4];
    LittleEndian::write_i32_into(&values, &mut bytes);
    bytes
}
