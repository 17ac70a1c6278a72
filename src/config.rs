//! Device configuration and the pipe-separated DeviceID string
//!
//! Host applications describe one outstation with a single configuration
//! string:
//!
//! ```text
//! IP|Port|COA|K|W|T0|T1|T2|T3|InterrogationType|InterrogationInterval|Blocks
//! ```
//!
//! Parsing is deliberately tolerant, matching how channel parameters are
//! loaded elsewhere in the stack: missing trailing fields take their
//! defaults, and an unparseable field falls back to its default with a
//! warning instead of failing the whole device.
//!
//! `Blocks` is a `;`-separated list of `start-end:mode` items where mode is
//! `cyclic` (rely on cyclic/spontaneous transmission) or `read` (issue a read
//! command per address on every poll pass).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::{MAX_COMMON_ADDR, MAX_OBJECT_ADDR};
use crate::client::ClientConfig;
use crate::connection::ConnectionConfig;
use crate::types::{DEFAULT_PORT, QOI_STATION};

/// How the reader acquires the points of one contiguous IOA range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Values arrive through cyclic or spontaneous transmission
    Cyclic,
    /// The reader polls each address with a read command
    Read,
}

/// A contiguous range of information object addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
    pub mode: BlockMode,
}

impl BlockRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

/// Everything needed to run one outstation: link, session and poll settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub host: String,
    pub port: u16,
    pub common_addr: u16,
    pub k: u16,
    pub w: u16,
    pub t0: Duration,
    pub t1: Duration,
    pub t2: Duration,
    pub t3: Duration,
    /// Qualifier of the periodic interrogation (20 general, 21..=36 groups)
    pub interrogation_qoi: u8,
    /// Period between interrogations; zero disables them
    pub interrogation_interval: Duration,
    /// Poll loop period
    pub read_interval: Duration,
    pub command_timeout: Duration,
    pub termination_timeout: Duration,
    pub queue_capacity: usize,
    pub blocks: Vec<BlockRange>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let link = ConnectionConfig::default();
        Self {
            host: link.host,
            port: link.port,
            common_addr: 1,
            k: link.k,
            w: link.w,
            t0: link.t0,
            t1: link.t1,
            t2: link.t2,
            t3: link.t3,
            interrogation_qoi: QOI_STATION,
            interrogation_interval: Duration::from_secs(300),
            read_interval: Duration::from_millis(1000),
            command_timeout: Duration::from_secs(5),
            termination_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            blocks: Vec::new(),
        }
    }
}

impl DeviceSettings {
    /// Parse a pipe-separated DeviceID string; never fails
    pub fn from_device_string(input: &str) -> Self {
        let mut settings = Self::default();
        let fields: Vec<&str> = input.split('|').map(str::trim).collect();

        if let Some(host) = fields.first() {
            if host.is_empty() {
                warn!("device string '{input}' has an empty host, using {}", settings.host);
            } else {
                settings.host = host.to_string();
            }
        }
        settings.port = parse_or(&fields, 1, DEFAULT_PORT, "port", input);
        settings.common_addr = parse_or(&fields, 2, settings.common_addr, "COA", input);
        if settings.common_addr == 0 || settings.common_addr > MAX_COMMON_ADDR {
            warn!(
                "device string '{input}' COA {} outside 1..={MAX_COMMON_ADDR}, using 1",
                settings.common_addr
            );
            settings.common_addr = 1;
        }
        settings.k = parse_or(&fields, 3, settings.k, "K", input);
        settings.w = parse_or(&fields, 4, settings.w, "W", input);
        settings.t0 = Duration::from_secs(parse_or(&fields, 5, settings.t0.as_secs(), "T0", input));
        settings.t1 = Duration::from_secs(parse_or(&fields, 6, settings.t1.as_secs(), "T1", input));
        settings.t2 = Duration::from_secs(parse_or(&fields, 7, settings.t2.as_secs(), "T2", input));
        settings.t3 = Duration::from_secs(parse_or(&fields, 8, settings.t3.as_secs(), "T3", input));
        settings.interrogation_qoi = parse_or(
            &fields,
            9,
            settings.interrogation_qoi,
            "interrogation type",
            input,
        );
        settings.interrogation_interval = Duration::from_secs(parse_or(
            &fields,
            10,
            settings.interrogation_interval.as_secs(),
            "interrogation interval",
            input,
        ));
        if let Some(blocks) = fields.get(11) {
            settings.blocks = parse_blocks(blocks, input);
        }
        settings
    }

    /// Registry key: `{ip}-{port}-{coa}`
    pub fn device_id(&self) -> String {
        format!("{}-{}-{}", self.host, self.port, self.common_addr)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.host.clone(),
            port: self.port,
            k: self.k,
            w: self.w,
            t0: self.t0,
            t1: self.t1,
            t2: self.t2,
            t3: self.t3,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection: self.connection_config(),
            common_addr: self.common_addr,
            command_timeout: self.command_timeout,
            termination_timeout: self.termination_timeout,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse_or<T: FromStr + Copy>(fields: &[&str], index: usize, default: T, name: &str, input: &str) -> T {
    match fields.get(index) {
        None => default,
        Some(raw) if raw.is_empty() => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("device string '{input}' has unparseable {name} '{raw}', using default");
                default
            }
        },
    }
}

fn parse_blocks(raw: &str, input: &str) -> Vec<BlockRange> {
    let mut blocks = Vec::new();
    for item in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        match parse_block(item) {
            Some(block) => blocks.push(block),
            None => warn!("device string '{input}' has unparseable block '{item}', skipped"),
        }
    }
    blocks
}

fn parse_block(item: &str) -> Option<BlockRange> {
    let (range, mode) = match item.split_once(':') {
        Some((range, mode)) => (range, mode),
        None => (item, "cyclic"),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (start.trim().parse().ok()?, end.trim().parse().ok()?),
        None => {
            let single: u32 = range.trim().parse().ok()?;
            (single, single)
        }
    };
    if start == 0 || end < start || end > MAX_OBJECT_ADDR {
        return None;
    }
    let mode = match mode.trim().to_ascii_lowercase().as_str() {
        "cyclic" => BlockMode::Cyclic,
        "read" => BlockMode::Read,
        _ => return None,
    };
    Some(BlockRange { start, end, mode })
}
