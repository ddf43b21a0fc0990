//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

use super::block_control::{self, BlockAction, BlockReply};
use super::bucket::{self, Lookup};
use super::clock::{Clock, SystemClock};
use super::eviction::ExpireMode;
use super::fixed::{delay_ms, Milli};
use super::host::{AttributeSource, DelayScheduler, Verdict};
use super::key::{CompositeKey, KeyError};
use super::location::{Location, Rule};
use super::rules::RulesConfig;
use super::segment::SegmentSnapshot;
use super::zone::ZoneRegistry;
use crate::error::{Result, ZonelimitError};
use crate::log_at;

type LocationMap = HashMap<String, Arc<Location>>;

/// The core rate limiter: zones, compiled locations and the clock.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Table operations hold one zone lock at a time and never across an await.
pub struct RateLimiter {
    zones: ZoneRegistry,
    locations: RwLock<Arc<LocationMap>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter for `rules` on the system clock.
    pub fn new(rules: &RulesConfig) -> Result<Self> {
        Self::with_clock(rules, Arc::new(SystemClock))
    }

    /// Create a rate limiter for `rules` driven by `clock`.
    pub fn with_clock(rules: &RulesConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let zones = ZoneRegistry::new();
        let locations = rules.compile(&zones)?;
        info!(
            zones = zones.len(),
            locations = locations.len(),
            "Rate limiter initialized"
        );
        Ok(Self {
            zones,
            locations: RwLock::new(Arc::new(locations)),
            clock,
        })
    }

    /// Swap in a new rules document.
    ///
    /// Compatible zones keep their records. On error the running
    /// configuration stays in place.
    pub fn reload(&self, rules: &RulesConfig) -> Result<()> {
        let locations = rules.compile(&self.zones)?;
        info!(
            zones = self.zones.len(),
            locations = locations.len(),
            "Rate limit rules reloaded"
        );
        *self.locations.write() = Arc::new(locations);
        Ok(())
    }

    /// Look up a compiled location by name.
    pub fn location(&self, name: &str) -> Option<Arc<Location>> {
        self.locations.read().get(name).cloned()
    }

    /// Names of all configured locations, sorted.
    pub fn location_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locations.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    /// Judge a request against every rule of `location`.
    ///
    /// Rules are evaluated in order. A rule whose key cannot be built is
    /// skipped. The first blocked or over-burst rule refuses the request;
    /// otherwise the rule with the largest excess decides whether, and for
    /// how long, the request is delayed.
    pub fn check<S>(&self, location: &Location, source: &S) -> Verdict
    where
        S: AttributeSource + ?Sized,
    {
        if !location.is_limiting() {
            return Verdict::Pass;
        }

        if let Some(whitelist) = &location.whitelist {
            if whitelist.matches(source) {
                trace!(location = %location.name, "Whitelisted request");
                return Verdict::Pass;
            }
        }

        let now = self.clock.now();
        let mut decider: Option<(&Rule, u64)> = None;

        for rule in &location.rules {
            let zone = &rule.zone;

            let key = match CompositeKey::build(zone.key_attrs(), source) {
                Ok(key) => key,
                Err(err @ KeyError::Oversized { .. }) => {
                    error!(zone = %zone.name(), error = %err, "Skipping rule");
                    continue;
                }
                Err(err) => {
                    trace!(zone = %zone.name(), error = %err, "Skipping rule");
                    continue;
                }
            };

            let params = rule.params();
            let outcome = {
                let mut table = zone.lock();
                table.expire(now, params.rate, ExpireMode::Light);
                let outcome = bucket::lookup(&mut table, &key, &params, now);
                if outcome.lookup == Lookup::Miss
                    && table.insert(&key, now, params.rate).is_err()
                {
                    drop(table);
                    let err = ZonelimitError::Capacity {
                        zone: zone.name().to_string(),
                    };
                    error!(error = %err, "Refusing request");
                    return Verdict::Reject {
                        status: location.status,
                        action: None,
                        zone: Some(zone.name().to_string()),
                    };
                }
                outcome
            };

            trace!(
                zone = %zone.name(),
                key = %key,
                outcome = ?outcome.lookup,
                "Rule evaluated"
            );

            if let Some(reading) = outcome.segment {
                zone.record_segment(SegmentSnapshot {
                    rate_seg: rule.rate_seg,
                    reading,
                });
            }

            match outcome.lookup {
                Lookup::Blocked { until } => {
                    log_at!(
                        location.log_level,
                        zone = %zone.name(),
                        block_stop_time = until,
                        "Blocking requests"
                    );
                    return refuse(location, rule);
                }
                Lookup::Rejected { excess } => {
                    log_at!(
                        location.log_level,
                        zone = %zone.name(),
                        excess = %Milli(excess),
                        "Limiting requests"
                    );
                    return refuse(location, rule);
                }
                Lookup::Throttled { excess } => {
                    if decider.map_or(true, |(_, max)| excess > max) {
                        decider = Some((rule, excess));
                    }
                }
                Lookup::Allowed | Lookup::Miss => {}
            }
        }

        match decider {
            Some((rule, excess)) if !rule.nodelay => {
                let delay_ms = delay_ms(excess, rule.zone.rate());
                log_at!(
                    location.delay_log_level(),
                    zone = %rule.zone.name(),
                    excess = %Milli(excess),
                    delay_ms,
                    "Delaying request"
                );
                Verdict::Delay {
                    delay_ms,
                    zone: rule.zone.name().to_string(),
                }
            }
            _ => Verdict::Pass,
        }
    }

    /// Judge a request and, when it must be delayed, wait on `scheduler`
    /// before returning the verdict.
    pub async fn enforce<S>(
        &self,
        location: &Location,
        source: &S,
        scheduler: &dyn DelayScheduler,
    ) -> Verdict
    where
        S: AttributeSource + Sync + ?Sized,
    {
        let verdict = self.check(location, source);
        if let Some(delay) = verdict.delay() {
            scheduler.delay(delay).await;
        }
        verdict
    }

    /// Run the block-control action bound to `location` for the key `source`
    /// yields.
    ///
    /// Returns `Ok(None)` when the location has no block-control binding and
    /// an error when `set` cannot allocate a record.
    pub fn block_control<S>(&self, location: &Location, source: &S) -> Result<Option<BlockReply>>
    where
        S: AttributeSource + ?Sized,
    {
        let Some(binding) = &location.block else {
            return Ok(None);
        };
        let zone = &binding.zone;

        let key = match CompositeKey::build(&binding.key_attrs, source) {
            Ok(key) => key,
            Err(err) => {
                debug!(zone = %zone.name(), error = %err, "Block control without key");
                return Ok(Some(BlockReply::error("limit vars is empty")));
            }
        };

        if binding.action == BlockAction::None {
            error!(location = %location.name, "No block action configured");
        }

        let now = self.clock.now();
        let outcome = {
            let mut table = zone.lock();
            block_control::apply(
                &mut table,
                &key,
                binding.action,
                binding.block_time,
                now,
                zone.rate(),
            )
        }
        .map_err(|_| ZonelimitError::Capacity {
            zone: zone.name().to_string(),
        })?;

        info!(
            zone = %zone.name(),
            action = %outcome.action,
            existed = outcome.existed,
            block_stop_time = outcome.block_stop_time,
            "Block control"
        );

        Ok(Some(BlockReply::from_outcome(&outcome, binding.block_time)))
    }

    /// The `COUNT=..;SEG=..;QPS=..` rate attribute of `location`: the latest
    /// segment reading of the first zone that has one.
    pub fn rate_variable(&self, location: &Location) -> Option<String> {
        if !location.is_limiting() {
            return None;
        }
        location
            .rules
            .iter()
            .find_map(|rule| rule.zone.segment())
            .map(|snapshot| snapshot.to_string())
    }
}

fn refuse(location: &Location, rule: &Rule) -> Verdict {
    if let Some(action) = &rule.forbid_action {
        log_at!(
            location.log_level,
            zone = %rule.zone.name(),
            forbid_action = ?action,
            "Limiting requests with forbid action"
        );
    }
    Verdict::Reject {
        status: location.status,
        action: rule.forbid_action.clone(),
        zone: Some(rule.zone.name().to_string()),
    }
}
