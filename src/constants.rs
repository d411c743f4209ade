pub const TICK_RATE_MS: u64 = 500;
// Expired cache entries are swept on this interval.
pub const CACHE_CLEANUP_SECS: u64 = 5 * 60;

pub const DEFAULT_CACHE_PREFIX: &str = "netflow_";
pub const METADATA_SUFFIX: &str = "metadata";
// Entries dropped before the single retry of a write that hit the quota.
pub const QUOTA_EVICT_COUNT: usize = 5;

pub const HANDLE_TOLERANCE_PX: f64 = 6.0;
// Columns left of the traffic plot for the rate labels.
pub const Y_LABEL_WIDTH: u16 = 13;

pub const SANKEY_LINK_CAP: usize = 200;
pub const SANKEY_PASS_THROUGH: [&str; 5] = ["srcaddr", "dstaddr", "srcport", "dstport", "protocol"];

/// Cache lifetime presets, in milliseconds.
pub struct CacheTtl;

impl CacheTtl {
    pub const SHORT: u64 = 60 * 1000;
    pub const MEDIUM: u64 = 5 * 60 * 1000;
    pub const LONG: u64 = 15 * 60 * 1000;
    pub const HOUR: u64 = 60 * 60 * 1000;
    pub const DAY: u64 = 24 * 60 * 60 * 1000;
}
