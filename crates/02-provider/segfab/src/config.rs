//! Provider tunables and their `FI_SEGFAB_*` environment overrides.

use segfab_transport::{Timeout, MIN_RING_BYTES};
use tracing::{debug, warn};

use crate::error::{FabricError, FabricResult};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "FI_SEGFAB_";

/// Default ring size per direction and connection.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Default number of ring buffers carved out of one data segment.
pub const DEFAULT_BUFFERS_PER_SEGMENT: usize = 16;
/// Message data segments use the upper half of the segment-id space.
pub const DEFAULT_MIN_MSG_SEGMENT_ID: u32 = 1 << 31;
/// Number of data segment identifiers available by default.
pub const DEFAULT_MSG_SEGMENT_RANGE: u32 = 1024;
/// Default bucket count of the memory-region registry.
pub const DEFAULT_MR_MAP_BUCKETS: usize = 251;
/// How long an accepting endpoint waits for the connector's half of the
/// handshake by default.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: i64 = 10_000;

/// Resolved provider configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Data bytes per ring buffer (one direction of one connection).
    pub buffer_size: usize,
    /// Ring buffers per lazily created data segment.
    pub buffers_per_segment: usize,
    /// First segment id used for message data segments.
    pub min_msg_segment_id: u32,
    /// One past the last segment id used for message data segments.
    pub max_msg_segment_id: u32,
    /// Handshake records in a listener's control segment.
    pub max_peers: usize,
    /// Adapter number the provider was opened on.
    pub adapter: u32,
    /// Buckets in the memory-region registry.
    pub mr_map_buckets: usize,
    /// Bound on the connecting side's waits.
    pub connect_timeout: Timeout,
    /// Bound on the accepting side's wait for the connector.
    pub accept_timeout: Timeout,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let min = DEFAULT_MIN_MSG_SEGMENT_ID;
        let max = min + DEFAULT_MSG_SEGMENT_RANGE;
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffers_per_segment: DEFAULT_BUFFERS_PER_SEGMENT,
            min_msg_segment_id: min,
            max_msg_segment_id: max,
            max_peers: (max - min) as usize * DEFAULT_BUFFERS_PER_SEGMENT,
            adapter: 0,
            mr_map_buckets: DEFAULT_MR_MAP_BUCKETS,
            connect_timeout: Timeout::Infinite,
            accept_timeout: Timeout::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS),
        }
    }
}

impl ProviderConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> FabricResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> FabricResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |suffix: &str| -> Option<i64> {
            let name = format!("{ENV_PREFIX}{suffix}");
            let raw = lookup(&name)?;
            match parse_tunable(&raw) {
                Some(value) => {
                    debug!(%name, value, "environment override");
                    Some(value)
                }
                None => {
                    warn!(%name, %raw, "ignoring unparsable environment override");
                    None
                }
            }
        };

        if let Some(v) = read("BUFFER_SIZE") {
            config.buffer_size = non_negative(v);
        }
        if let Some(v) = read("BUFFERS_PER_SEGMENT") {
            config.buffers_per_segment = non_negative(v);
        }
        if let Some(v) = read("MIN_MSG_SEGMID") {
            config.min_msg_segment_id = clamp_u32(v);
            config.max_msg_segment_id = config
                .min_msg_segment_id
                .saturating_add(DEFAULT_MSG_SEGMENT_RANGE);
        }
        if let Some(v) = read("MAX_MSG_SEGMID") {
            config.max_msg_segment_id = clamp_u32(v);
        }
        config.max_peers = config.derived_max_peers();
        if let Some(v) = read("MAX_PEERS") {
            config.max_peers = non_negative(v);
        }
        if let Some(v) = read("ADAPTER_NO") {
            config.adapter = clamp_u32(v);
        }
        if let Some(v) = read("MR_MAP_SIZE") {
            config.mr_map_buckets = non_negative(v);
        }
        if let Some(v) = read("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Timeout::from_millis(v);
        }
        if let Some(v) = read("ACCEPT_TIMEOUT_MS") {
            config.accept_timeout = Timeout::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Peers a control segment can hold when `max_peers` is not set explicitly.
    pub fn derived_max_peers(&self) -> usize {
        self.max_msg_segment_id.saturating_sub(self.min_msg_segment_id) as usize
            * self.buffers_per_segment
    }

    /// Largest payload one ring frame can carry.
    pub fn max_msg_size(&self) -> usize {
        self.buffer_size - segfab_transport::FRAME_HEADER
    }

    pub fn validate(&self) -> FabricResult<()> {
        if self.buffer_size < MIN_RING_BYTES.max(64) || self.buffer_size % 8 != 0 {
            return Err(FabricError::Inval(
                "buffer size must be a multiple of 8 and at least 64 bytes",
            ));
        }
        if self.buffers_per_segment == 0 {
            return Err(FabricError::Inval("buffers per segment must be positive"));
        }
        if self.max_msg_segment_id <= self.min_msg_segment_id {
            return Err(FabricError::Inval("message segment id range is empty"));
        }
        if self.max_peers == 0 {
            return Err(FabricError::Inval("max peers must be positive"));
        }
        if self.mr_map_buckets == 0 {
            return Err(FabricError::Inval("memory region map needs a bucket"));
        }
        Ok(())
    }
}

/// Integer if the value starts with a digit or `-`, `yes`/`on` as 1 and
/// `no`/`off` as 0.
pub fn parse_tunable(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let first = raw.chars().next()?;
    if first.is_ascii_digit() || first == '-' {
        let end = raw
            .char_indices()
            .skip(1)
            .find(|(_, c)| !c.is_ascii_digit())
            .map_or(raw.len(), |(i, _)| i);
        return raw[..end].parse().ok();
    }
    match raw.to_ascii_lowercase().as_str() {
        "yes" | "on" => Some(1),
        "no" | "off" => Some(0),
        _ => None,
    }
}

fn non_negative(v: i64) -> usize {
    v.max(0) as usize
}

fn clamp_u32(v: i64) -> u32 {
    v.clamp(0, u32::MAX as i64) as u32
}
