//! Compiled per-location policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::autoblock::AutoBlock;
use super::block_control::BlockAction;
use super::bucket::BucketParams;
use super::host::{AttributeSource, ForbidAction};
use super::zone::Zone;

/// Status used for refused requests when none is configured.
pub const DEFAULT_STATUS: u16 = 503;

/// Severity for limit and delay events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Notice,
    Warn,
    #[default]
    Error,
}

impl LogLevel {
    /// Level used for delays: one step less severe than the limit level.
    pub fn relaxed(self) -> Self {
        match self {
            LogLevel::Info | LogLevel::Notice => LogLevel::Info,
            LogLevel::Warn => LogLevel::Notice,
            LogLevel::Error => LogLevel::Warn,
        }
    }
}

/// Emit a tracing event at a [`LogLevel`] chosen at runtime.
///
/// `notice` has no tracing counterpart and is logged at info.
#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::ratelimit::LogLevel::Info | $crate::ratelimit::LogLevel::Notice => {
                ::tracing::info!($($arg)+)
            }
            $crate::ratelimit::LogLevel::Warn => ::tracing::warn!($($arg)+),
            $crate::ratelimit::LogLevel::Error => ::tracing::error!($($arg)+),
        }
    };
}

/// Requests whose attribute equals the value skip every rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist {
    pub attribute: String,
    pub value: String,
}

impl Whitelist {
    pub fn matches<S: AttributeSource + ?Sized>(&self, source: &S) -> bool {
        source.attribute(&self.attribute) == Some(self.value.as_bytes())
    }
}

/// One `zone` reference within a location.
#[derive(Debug, Clone)]
pub struct Rule {
    pub zone: Arc<Zone>,
    /// ×1000
    pub burst: u64,
    pub nodelay: bool,
    pub forbid_action: Option<ForbidAction>,
    pub rate_seg: u64,
    pub auto_block: Option<AutoBlock>,
}

impl Rule {
    pub fn params(&self) -> BucketParams {
        BucketParams {
            rate: self.zone.rate(),
            burst: self.burst,
            rate_seg: self.rate_seg,
            auto_block: self.auto_block,
        }
    }
}

/// Block-control endpoint settings of a location.
#[derive(Debug, Clone)]
pub struct BlockBinding {
    pub action: BlockAction,
    pub zone: Arc<Zone>,
    /// Seconds a `set` blocks for.
    pub block_time: u64,
    pub key_attrs: Vec<String>,
}

/// Everything the limiter needs to judge requests for one location.
#[derive(Debug, Clone)]
pub struct Location {
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<Rule>,
    pub whitelist: Option<Whitelist>,
    pub status: u16,
    pub log_level: LogLevel,
    pub block: Option<BlockBinding>,
}

impl Location {
    /// Level used when a request is delayed.
    pub fn delay_log_level(&self) -> LogLevel {
        self.log_level.relaxed()
    }

    /// Whether requests for this location go through the rules at all.
    pub fn is_limiting(&self) -> bool {
        self.enabled && !self.rules.is_empty()
    }
}
