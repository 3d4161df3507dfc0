// Query commands
//
// A query is "C" followed by one letter per item, terminated by a newline.
// Each letter gets a one line reply, in order, and the server closes the
// connection once all of them have been written.

use crate::streaming::types::{StreamError, StreamResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Id count assumed when the server cannot report one
pub const DEFAULT_FA_ID_COUNT: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryCommand {
    SampleFrequency,
    LiveDecimation,
    FirstDecimation,
    SecondDecimation,
    FaIdCount,
    FaIdList,
    Status,
    Version,
    ServerName,
    CaptureMask,
}

impl QueryCommand {
    pub fn letter(self) -> char {
        match self {
            QueryCommand::SampleFrequency => 'F',
            QueryCommand::LiveDecimation => 'C',
            QueryCommand::FirstDecimation => 'd',
            QueryCommand::SecondDecimation => 'D',
            QueryCommand::FaIdCount => 'K',
            QueryCommand::FaIdList => 'L',
            QueryCommand::Status => 'S',
            QueryCommand::Version => 'V',
            QueryCommand::ServerName => 'N',
            QueryCommand::CaptureMask => 'M',
        }
    }
}

pub fn build_query(commands: &[QueryCommand]) -> Vec<u8> {
    let mut line = String::with_capacity(commands.len() + 2);
    line.push('C');
    line.extend(commands.iter().map(|c| c.letter()));
    line.push('\n');
    line.into_bytes()
}

pub fn parse_float(text: &str) -> StreamResult<f64> {
    let value = text.trim();
    value
        .parse::<f64>()
        .map_err(|_| StreamError::Protocol(format!("expected a number, got {:?}", value)))
}

pub fn parse_int(text: &str) -> StreamResult<u32> {
    let value = text.trim();
    value
        .parse::<u32>()
        .map_err(|_| StreamError::Protocol(format!("expected an integer, got {:?}", value)))
}

/// Reply to the combined `CFCK` query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub sample_frequency: f64,
    pub decimation: u32,
    pub fa_id_count: u32,
}

impl ServerInfo {
    pub const COMMANDS: &'static [QueryCommand] = &[
        QueryCommand::SampleFrequency,
        QueryCommand::LiveDecimation,
        QueryCommand::FaIdCount,
    ];

    /// Parses the three reply lines. Older servers answer `K` with an error
    /// line, in which case the id count defaults to 256.
    pub fn parse(reply: &str) -> StreamResult<Self> {
        let mut lines = reply.lines();
        let sample_frequency = parse_float(lines.next().unwrap_or_default())?;
        let decimation = parse_int(lines.next().unwrap_or_default())?;
        let fa_id_count = lines
            .next()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_FA_ID_COUNT);

        Ok(Self {
            sample_frequency,
            decimation,
            fa_id_count,
        })
    }

    /// Sample rate of the decimated stream
    pub fn decimated_frequency(&self) -> f64 {
        if self.decimation == 0 {
            self.sample_frequency
        } else {
            self.sample_frequency / f64::from(self.decimation)
        }
    }
}

/// Reply to the `S` query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnifferStatus {
    /// 1 = ok, 2 or 3 = link fault
    pub link_status: u32,
    /// 1023 when there is no partner
    pub link_partner: u32,
    pub last_interrupt: u32,
    pub frame_errors: u32,
    pub soft_errors: u32,
    pub hard_errors: u32,
    pub running: bool,
    pub overrun: bool,
}

impl SnifferStatus {
    pub fn parse(reply: &str) -> StreamResult<Self> {
        let values = reply
            .split_whitespace()
            .map(parse_int)
            .collect::<StreamResult<Vec<u32>>>()?;
        let [link_status, link_partner, last_interrupt, frame_errors, soft_errors, hard_errors, running, overrun] =
            values[..]
        else {
            return Err(StreamError::Protocol(format!(
                "expected 8 status values, got {}",
                values.len()
            )));
        };

        Ok(Self {
            link_status,
            link_partner,
            last_interrupt,
            frame_errors,
            soft_errors,
            hard_errors,
            running: running != 0,
            overrun: overrun != 0,
        })
    }

    pub fn link_ok(&self) -> bool {
        self.link_status == 1
    }
}

/// One line of the `L` query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaIdEntry {
    pub id: u32,
    pub description: String,
    pub archived: bool,
}

static FA_ID_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^( |\*)([0-9]+) (.*) (.*) (.*)$").expect("FA id line pattern is valid")
});

pub fn parse_fa_ids(reply: &str) -> StreamResult<Vec<FaIdEntry>> {
    reply
        .lines()
        .map(|line| {
            let captures = FA_ID_LINE.captures(line).ok_or_else(|| {
                StreamError::Protocol(format!("invalid FA id line: {:?}", line))
            })?;
            Ok(FaIdEntry {
                id: parse_int(&captures[2])?,
                description: captures[5].to_string(),
                archived: &captures[1] == "*",
            })
        })
        .collect()
}

/// Selects `(id, description)` pairs from an id listing.
///
/// `stored_only` keeps archived ids only. Entries without a description are
/// given an `FA-ID-<n>` name when `name_missing` is set and dropped otherwise.
pub fn select_fa_ids(
    entries: &[FaIdEntry],
    stored_only: bool,
    name_missing: bool,
) -> Vec<(u32, String)> {
    entries
        .iter()
        .filter(|entry| !stored_only || entry.archived)
        .filter_map(|entry| {
            if !entry.description.is_empty() {
                Some((entry.id, entry.description.clone()))
            } else if name_missing {
                Some((entry.id, format!("FA-ID-{}", entry.id)))
            } else {
                None
            }
        })
        .collect()
}
