// Channel masks for subscription requests
//
// A mask selects which FA ids the server streams. The server always returns
// the selected columns in ascending id order, so the mask keeps its ids sorted
// and offers `column_of` to map an id back to its column in a sample block.
//
// Two wire encodings exist:
// - range list: "1-3,7,9-12"
// - raw hex: 64 hex digits, most significant byte first, bit i = id i

use crate::streaming::types::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Number of addressable FA ids
pub const MASK_BITS: usize = 256;

/// Length of the raw hex mask encoding
pub const HEX_MASK_LEN: usize = MASK_BITS / 4;

/// Wire encoding used for the mask part of a subscribe command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaskEncoding {
    #[default]
    RangeList,
    Hex,
}

/// Sorted, deduplicated, non-empty set of FA ids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask {
    ids: Vec<u8>,
}

impl ChannelMask {
    /// Normalises `ids` (order and duplicates are irrelevant).
    pub fn new<I>(ids: I) -> StreamResult<Self>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut normalised = Vec::new();
        for id in ids {
            let id = u8::try_from(id).map_err(|_| {
                StreamError::InvalidMask(format!("id {} out of range 0..{}", id, MASK_BITS))
            })?;
            normalised.push(id);
        }
        normalised.sort_unstable();
        normalised.dedup();

        if normalised.is_empty() {
            return Err(StreamError::InvalidMask("mask is empty".to_string()));
        }
        Ok(Self { ids: normalised })
    }

    pub fn single(id: u8) -> Self {
        Self { ids: vec![id] }
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Column of `id` in a block returned for this mask
    pub fn column_of(&self, id: u8) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Encodes the mask, returning the id count alongside the text.
    pub fn encode(&self, encoding: MaskEncoding) -> (usize, String) {
        let text = match encoding {
            MaskEncoding::RangeList => self.to_range_list(),
            MaskEncoding::Hex => self.to_hex(),
        };
        (self.count(), text)
    }

    /// Compact "first-last,id,..." form
    pub fn to_range_list(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ids.iter().copied();
        let Some(mut first) = iter.next() else {
            return out;
        };
        let mut last = first;

        let flush = |out: &mut String, first: u8, last: u8| {
            if !out.is_empty() {
                out.push(',');
            }
            if first == last {
                let _ = write!(out, "{}", first);
            } else {
                let _ = write!(out, "{}-{}", first, last);
            }
        };

        for id in iter {
            if u16::from(id) != u16::from(last) + 1 {
                flush(&mut out, first, last);
                first = id;
            }
            last = id;
        }
        flush(&mut out, first, last);
        out
    }

    /// Fixed width bitmask, highest ids first
    pub fn to_hex(&self) -> String {
        let mut bytes = [0u8; MASK_BITS / 8];
        for &id in &self.ids {
            bytes[usize::from(id) / 8] |= 1 << (id % 8);
        }
        bytes.iter().rev().fold(String::with_capacity(HEX_MASK_LEN), |mut s, b| {
            let _ = write!(s, "{:02X}", b);
            s
        })
    }

    pub fn parse_range_list(text: &str) -> StreamResult<Self> {
        let mut ids = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            let (first, last) = match part.split_once('-') {
                Some((a, b)) => (parse_id(a)?, parse_id(b)?),
                None => {
                    let id = parse_id(part)?;
                    (id, id)
                }
            };
            if first > last {
                return Err(StreamError::InvalidMask(format!(
                    "descending range {}",
                    part
                )));
            }
            ids.extend(first..=last);
        }
        Self::new(ids)
    }

    pub fn parse_hex(text: &str) -> StreamResult<Self> {
        let text = text.trim();
        if text.len() != HEX_MASK_LEN || !text.is_ascii() {
            return Err(StreamError::InvalidMask(format!(
                "hex mask must be {} hex digits",
                HEX_MASK_LEN
            )));
        }

        let mut ids = Vec::new();
        let byte_count = MASK_BITS / 8;
        for (i, pair) in text.as_bytes().chunks(2).enumerate() {
            // Digits arrive most significant byte first
            let byte_index = byte_count - 1 - i;
            let pair = std::str::from_utf8(pair)
                .map_err(|e| StreamError::InvalidMask(e.to_string()))?;
            let byte = u8::from_str_radix(pair, 16)
                .map_err(|_| StreamError::InvalidMask(format!("bad hex digits {:?}", pair)))?;
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    ids.push((byte_index * 8 + bit) as u32);
                }
            }
        }
        Self::new(ids)
    }

    pub fn decode(text: &str, encoding: MaskEncoding) -> StreamResult<Self> {
        match encoding {
            MaskEncoding::RangeList => Self::parse_range_list(text),
            MaskEncoding::Hex => Self::parse_hex(text),
        }
    }
}

fn parse_id(text: &str) -> StreamResult<u32> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| StreamError::InvalidMask(format!("bad id {:?}", text)))
}

/// Normalises and encodes `ids` in one step.
pub fn encode_mask<I>(ids: I, encoding: MaskEncoding) -> StreamResult<(usize, String)>
where
    I: IntoIterator<Item = u32>,
{
    Ok(ChannelMask::new(ids)?.encode(encoding))
}
