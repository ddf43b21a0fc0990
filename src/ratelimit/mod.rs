//! Rate limiting logic and state management.

mod autoblock;
mod bitstat;
mod block_control;
mod bucket;
mod clock;
mod eviction;
mod fixed;
mod host;
mod key;
mod limiter;
mod location;
mod rules;
mod segment;
mod store;
mod zone;

pub use autoblock::{AutoBlock, BlockState};
pub use block_control::{BlockAction, BlockOutcome, BlockReply, DEFAULT_BLOCK_TIME};
pub use bucket::{BucketParams, Lookup, Outcome};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use eviction::ExpireMode;
pub use fixed::{parse_rate, parse_size, Milli};
pub use host::{AttributeSource, DelayScheduler, ForbidAction, TokioDelay, Verdict};
pub use key::{CompositeKey, KeyError};
pub use limiter::RateLimiter;
pub use location::{BlockBinding, Location, LogLevel, Rule, Whitelist, DEFAULT_STATUS};
pub use rules::RulesConfig;
pub use segment::{SegmentReading, SegmentSnapshot};
pub use store::{TableFull, ZoneTable};
pub use zone::{Zone, ZoneRegistry, ZoneSpec};
