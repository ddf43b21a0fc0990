//! Out-of-band query, set and clear of a record's hard block.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::clock::Timestamp;
use super::key::CompositeKey;
use super::store::{TableFull, ZoneTable};
use crate::error::ZonelimitError;

/// Block time used by `set` when none is configured, in seconds.
pub const DEFAULT_BLOCK_TIME: u64 = 1800;

/// Administrative action bound to a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    /// Recognized but does nothing.
    #[default]
    None,
    Query,
    Set,
    Clear,
}

impl FromStr for BlockAction {
    type Err = ZonelimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(BlockAction::Query),
            "set" => Ok(BlockAction::Set),
            "clear" => Ok(BlockAction::Clear),
            "none" => Ok(BlockAction::None),
            other => Err(ZonelimitError::config(format!(
                "invalid block action \"{}\"",
                other
            ))),
        }
    }
}

impl fmt::Display for BlockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockAction::None => "none",
            BlockAction::Query => "query",
            BlockAction::Set => "set",
            BlockAction::Clear => "clear",
        };
        f.write_str(name)
    }
}

/// What a block-control operation found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    pub action: BlockAction,
    /// Whether a record for the key existed beforehand.
    pub existed: bool,
    /// Block deadline reported back, 0 when not blocked.
    pub block_stop_time: u64,
}

/// Apply `action` to the record for `key`.
///
/// Every hit is promoted in the recency list, like a regular lookup. Only
/// `set` creates a missing record; it fails if the zone is full even after
/// a forced eviction pass.
pub fn apply(
    table: &mut ZoneTable,
    key: &CompositeKey,
    action: BlockAction,
    block_time: u64,
    now: Timestamp,
    rate: u64,
) -> Result<BlockOutcome, TableFull> {
    let now_sec = now.as_secs();
    let found = table.find_and_touch(key);
    let existed = found.is_some();

    let block_stop_time = match action {
        BlockAction::None => 0,
        BlockAction::Query => found
            .and_then(|id| table.get(id))
            .map(|r| r.block.active_stop_time(now_sec))
            .unwrap_or(0),
        BlockAction::Set => {
            let id = match found {
                Some(id) => id,
                None => table.insert(key, now, rate)?,
            };
            let stop_time = now_sec.saturating_add(block_time);
            if let Some(record) = table.get_mut(id) {
                record.block.stop_time = stop_time;
            }
            stop_time
        }
        BlockAction::Clear => {
            if let Some(record) = found.and_then(|id| table.get_mut(id)) {
                record.block.stop_time = 0;
                record.excess = 0;
            }
            0
        }
    };

    Ok(BlockOutcome {
        action,
        existed,
        block_stop_time,
    })
}

/// JSON document returned by the block-control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReply {
    pub ret: bool,
    pub block_stop_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl BlockReply {
    pub fn from_outcome(outcome: &BlockOutcome, block_time: u64) -> Self {
        Self {
            ret: outcome.action != BlockAction::None,
            block_stop_time: outcome.block_stop_time,
            block_time: (outcome.action == BlockAction::Set).then_some(block_time),
            errmsg: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ret: false,
            block_stop_time: 0,
            block_time: None,
            errmsg: Some(msg.into()),
        }
    }
}
