//! Rate limit rules configuration.
//!
//! This module loads the rules document (zones, location defaults and named
//! locations) from YAML and compiles it into [`Location`]s bound to live zones.
//!
//! ```yaml
//! zones:
//!   - name: per_ip
//!     size: 10m
//!     rate: 10r/s
//!     key: [remote_addr]
//! defaults:
//!   status: 429
//! locations:
//!   api:
//!     rules:
//!       - zone: per_ip
//!         burst: 20
//!         block: 5x60x1800
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::autoblock::AutoBlock;
use super::block_control::{BlockAction, DEFAULT_BLOCK_TIME};
use super::fixed::{parse_rate, parse_size, REQUEST_COST, MIN_ZONE_SIZE};
use super::host::ForbidAction;
use super::location::{BlockBinding, Location, LogLevel, Rule, Whitelist, DEFAULT_STATUS};
use super::zone::{Zone, ZoneRegistry, ZoneSpec};
use crate::error::{Result, ZonelimitError};

/// A complete rules document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Zone declarations
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    /// Settings inherited by every location that leaves them unset
    #[serde(default)]
    pub defaults: LocationConfig,
    /// Named locations
    #[serde(default)]
    pub locations: BTreeMap<String, LocationConfig>,
}

/// A zone size, either bytes or a string with a `k`, `m` or `g` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(usize),
    Text(String),
}

impl SizeValue {
    fn bytes(&self) -> Result<usize> {
        match self {
            SizeValue::Bytes(n) => Ok(*n),
            SizeValue::Text(s) => parse_size(s),
        }
    }
}

/// Zone declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    pub name: String,
    pub size: SizeValue,
    /// `Nr/s` or `Nr/m`
    pub rate: String,
    /// Attributes forming the key, in order
    pub key: Vec<String>,
}

/// One rule of a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub zone: String,
    /// Requests tolerated above the rate
    #[serde(default)]
    pub burst: u64,
    #[serde(default)]
    pub nodelay: bool,
    /// `@named_location` or `/uri`
    #[serde(default)]
    pub forbid_action: Option<String>,
    /// Segment length in milliseconds for the rate attribute
    #[serde(default)]
    pub rate_seg: u64,
    /// Auto-block spec `times x interval x duration`, e.g. `5x60x1800`
    #[serde(default)]
    pub block: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhitelistConfig {
    pub attribute: String,
    pub value: String,
}

/// Block-control endpoint of a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    pub action: BlockAction,
    pub zone: String,
    #[serde(default = "default_block_time")]
    pub block_time: u64,
    /// Key attributes; the zone's own when empty
    #[serde(default)]
    pub key: Vec<String>,
}

fn default_block_time() -> u64 {
    DEFAULT_BLOCK_TIME
}

/// Location settings; every field is optional so it can inherit from defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub rules: Option<Vec<RuleConfig>>,
    #[serde(default)]
    pub whitelist: Option<WhitelistConfig>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default)]
    pub block: Option<BlockConfig>,
}

impl LocationConfig {
    /// Fill unset fields from `parent`.
    fn merged_with(&self, parent: &LocationConfig) -> LocationConfig {
        LocationConfig {
            enabled: self.enabled.or(parent.enabled),
            rules: self.rules.clone().or_else(|| parent.rules.clone()),
            whitelist: self.whitelist.clone().or_else(|| parent.whitelist.clone()),
            status: self.status.or(parent.status),
            log_level: self.log_level.or(parent.log_level),
            block: self.block.clone().or_else(|| parent.block.clone()),
        }
    }
}

/// Parse an auto-block spec such as `5x60x1800`.
pub fn parse_block_spec(value: &str) -> Result<AutoBlock> {
    let invalid = |what: &str| ZonelimitError::config(format!("invalid {} in block \"{}\"", what, value));

    let mut parts = value.splitn(3, 'x');
    let (Some(times), Some(interval), Some(duration)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ZonelimitError::config(format!("invalid block \"{}\"", value)));
    };

    let times: u32 = times.trim().parse().map_err(|_| invalid("times"))?;
    if times == 0 || times > 64 {
        return Err(ZonelimitError::config(format!(
            "block times must be between 1 and 64 in \"{}\"",
            value
        )));
    }
    let interval: u64 = interval.trim().parse().map_err(|_| invalid("interval"))?;
    let duration: u64 = duration.trim().parse().map_err(|_| invalid("duration"))?;

    AutoBlock::new(times, interval, duration)
        .ok_or_else(|| ZonelimitError::config(format!("invalid block \"{}\"", value)))
}

impl RulesConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate the zone declarations.
    pub fn zone_specs(&self) -> Result<Vec<ZoneSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.zones.len());

        for zone in &self.zones {
            if zone.name.is_empty() {
                return Err(ZonelimitError::config("zone name is empty"));
            }
            if !seen.insert(zone.name.as_str()) {
                return Err(ZonelimitError::config(format!(
                    "zone \"{}\" is already bound",
                    zone.name
                )));
            }

            let size = zone.size.bytes()?;
            if size < MIN_ZONE_SIZE {
                return Err(ZonelimitError::config(format!(
                    "zone \"{}\" is too small",
                    zone.name
                )));
            }

            if zone.key.is_empty() || zone.key.iter().any(|k| k.is_empty()) {
                return Err(ZonelimitError::config(format!(
                    "no key attributes defined for zone \"{}\"",
                    zone.name
                )));
            }

            specs.push(ZoneSpec {
                name: zone.name.clone(),
                key_attrs: zone.key.clone(),
                rate: parse_rate(&zone.rate)?,
                size,
            });
        }

        Ok(specs)
    }

    /// Validate the whole document, bind it to `registry` and return the
    /// compiled locations by name.
    ///
    /// The registry is only changed once every location compiled.
    pub fn compile(&self, registry: &ZoneRegistry) -> Result<HashMap<String, Arc<Location>>> {
        let specs = self.zone_specs()?;
        let zones = registry.prepare(&specs)?;
        let by_name: HashMap<&str, &Arc<Zone>> =
            zones.iter().map(|z| (z.name(), z)).collect();

        let mut locations = HashMap::with_capacity(self.locations.len());
        for (name, raw) in &self.locations {
            let merged = raw.merged_with(&self.defaults);
            let location = compile_location(name, &merged, &by_name)?;
            debug!(
                location = %name,
                rules = location.rules.len(),
                enabled = location.enabled,
                "Compiled location"
            );
            locations.insert(name.clone(), Arc::new(location));
        }

        registry.commit(&zones);
        Ok(locations)
    }
}

fn lookup_zone(by_name: &HashMap<&str, &Arc<Zone>>, location: &str, zone: &str) -> Result<Arc<Zone>> {
    by_name
        .get(zone)
        .map(|z| Arc::clone(z))
        .ok_or_else(|| {
            ZonelimitError::config(format!(
                "unknown zone \"{}\" in location \"{}\"",
                zone, location
            ))
        })
}

fn compile_location(
    name: &str,
    raw: &LocationConfig,
    by_name: &HashMap<&str, &Arc<Zone>>,
) -> Result<Location> {
    let mut rules = Vec::new();
    let mut has_rate_seg = false;

    for rule in raw.rules.as_deref().unwrap_or_default() {
        let zone = lookup_zone(by_name, name, &rule.zone)?;

        if rules.iter().any(|r: &Rule| r.zone.name() == zone.name()) {
            return Err(ZonelimitError::config(format!(
                "zone \"{}\" is duplicate in location \"{}\"",
                rule.zone, name
            )));
        }

        if rule.rate_seg > 0 {
            if has_rate_seg {
                return Err(ZonelimitError::config(format!(
                    "duplicate rate_seg in location \"{}\"",
                    name
                )));
            }
            has_rate_seg = true;
        }

        let forbid_action = match &rule.forbid_action {
            Some(action) => Some(ForbidAction::parse(action).ok_or_else(|| {
                ZonelimitError::config(format!("invalid forbid_action \"{}\"", action))
            })?),
            None => None,
        };

        let auto_block = rule.block.as_deref().map(parse_block_spec).transpose()?;

        let burst = rule
            .burst
            .checked_mul(REQUEST_COST as u64)
            .ok_or_else(|| ZonelimitError::config(format!("invalid burst {}", rule.burst)))?;

        rules.push(Rule {
            zone,
            burst,
            nodelay: rule.nodelay,
            forbid_action,
            rate_seg: rule.rate_seg,
            auto_block,
        });
    }

    let status = raw.status.unwrap_or(DEFAULT_STATUS);
    if !(400..=599).contains(&status) {
        return Err(ZonelimitError::config(format!(
            "status {} must be between 400 and 599",
            status
        )));
    }

    let block = match &raw.block {
        Some(block) => {
            let zone = lookup_zone(by_name, name, &block.zone)?;
            if block.block_time == 0 {
                return Err(ZonelimitError::config(format!(
                    "invalid block_time in location \"{}\"",
                    name
                )));
            }
            let key_attrs = if block.key.is_empty() {
                zone.key_attrs().to_vec()
            } else {
                block.key.clone()
            };
            Some(BlockBinding {
                action: block.action,
                zone,
                block_time: block.block_time,
                key_attrs,
            })
        }
        None => None,
    };

    Ok(Location {
        name: name.to_string(),
        enabled: raw.enabled.unwrap_or(true),
        rules,
        whitelist: raw.whitelist.as_ref().map(|w| Whitelist {
            attribute: w.attribute.clone(),
            value: w.value.clone(),
        }),
        status,
        log_level: raw.log_level.unwrap_or_default(),
        block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
zones:
  - name: per_ip
    size: 10m
    rate: 10r/s
    key: [remote_addr]
  - name: per_key
    size: 65536
    rate: 30r/m
    key: [remote_addr, api_key]
defaults:
  status: 429
  log_level: warn
  whitelist:
    attribute: geo
    value: internal
locations:
  api:
    rules:
      - zone: per_ip
        burst: 20
        nodelay: true
      - zone: per_key
        burst: 5
        forbid_action: "@too_many"
        rate_seg: 1000
        block: 5x60x1800
  admin:
    status: 503
    enabled: false
    rules:
      - zone: per_ip
  unblock:
    block:
      action: clear
      zone: per_ip
"#;

    fn compile(yaml: &str) -> Result<HashMap<String, Arc<Location>>> {
        RulesConfig::from_yaml(yaml)?.compile(&ZoneRegistry::new())
    }

    fn expect_err(yaml: &str, needle: &str) {
        let err = compile(yaml).unwrap_err().to_string();
        assert!(err.contains(needle), "{} does not mention {}", err, needle);
    }

    #[test]
    fn test_parse_and_compile() {
        let registry = ZoneRegistry::new();
        let locations = RulesConfig::from_yaml(BASIC).unwrap().compile(&registry).unwrap();

        assert_eq!(registry.names(), vec!["per_ip", "per_key"]);
        assert_eq!(registry.get("per_ip").unwrap().size(), 10 * 1024 * 1024);
        assert_eq!(registry.get("per_key").unwrap().rate(), 500);

        let api = &locations["api"];
        assert!(api.is_limiting());
        assert_eq!(api.status, 429);
        assert_eq!(api.log_level, LogLevel::Warn);
        assert_eq!(api.delay_log_level(), LogLevel::Notice);
        assert!(api.whitelist.is_some());
        assert_eq!(api.rules.len(), 2);

        let first = &api.rules[0];
        assert_eq!(first.burst, 20_000);
        assert!(first.nodelay);
        assert_eq!(first.params().rate, 10_000);

        let second = &api.rules[1];
        assert_eq!(
            second.forbid_action,
            Some(ForbidAction::NamedLocation("@too_many".to_string()))
        );
        assert_eq!(second.rate_seg, 1000);
        assert_eq!(second.auto_block, AutoBlock::new(5, 60, 1800));
    }

    #[test]
    fn test_defaults_are_inherited_and_overridden() {
        let locations = compile(BASIC).unwrap();

        let admin = &locations["admin"];
        assert_eq!(admin.status, 503);
        assert!(!admin.enabled);
        assert!(!admin.is_limiting());

        let unblock = &locations["unblock"];
        assert!(unblock.rules.is_empty());
        let block = unblock.block.as_ref().unwrap();
        assert_eq!(block.action, BlockAction::Clear);
        assert_eq!(block.block_time, DEFAULT_BLOCK_TIME);
        assert_eq!(block.key_attrs, vec!["remote_addr"]);
    }

    #[test]
    fn test_block_spec() {
        assert_eq!(parse_block_spec("3x60x600").unwrap(), AutoBlock::new(3, 60, 600).unwrap());
        assert!(parse_block_spec("0x60x600").is_err());
        assert!(parse_block_spec("65x60x600").is_err());
        assert!(parse_block_spec("3x0x600").is_err());
        assert!(parse_block_spec("3x60").is_err());
        assert!(parse_block_spec("axbxc").is_err());
    }

    #[test]
    fn test_zone_too_small() {
        expect_err(
            "zones: [{name: z, size: 16k, rate: 1r/s, key: [remote_addr]}]",
            "too small",
        );
    }

    #[test]
    fn test_zone_declared_twice() {
        expect_err(
            r#"
zones:
  - {name: z, size: 1m, rate: 1r/s, key: [remote_addr]}
  - {name: z, size: 1m, rate: 2r/s, key: [remote_addr]}
"#,
            "already bound",
        );
    }

    #[test]
    fn test_zone_without_key() {
        expect_err("zones: [{name: z, size: 1m, rate: 1r/s, key: []}]", "no key attributes");
    }

    #[test]
    fn test_invalid_rate() {
        expect_err(
            "zones: [{name: z, size: 1m, rate: fast, key: [remote_addr]}]",
            "invalid rate",
        );
    }

    #[test]
    fn test_unknown_zone_in_rule() {
        expect_err("locations: {api: {rules: [{zone: nope}]}}", "unknown zone");
    }

    #[test]
    fn test_duplicate_zone_in_location() {
        expect_err(
            r#"
zones: [{name: z, size: 1m, rate: 1r/s, key: [remote_addr]}]
locations:
  api:
    rules: [{zone: z}, {zone: z, burst: 3}]
"#,
            "is duplicate",
        );
    }

    #[test]
    fn test_second_rate_seg_rejected() {
        expect_err(
            r#"
zones:
  - {name: a, size: 1m, rate: 1r/s, key: [remote_addr]}
  - {name: b, size: 1m, rate: 1r/s, key: [uri]}
locations:
  api:
    rules: [{zone: a, rate_seg: 1000}, {zone: b, rate_seg: 500}]
"#,
            "duplicate rate_seg",
        );
    }

    #[test]
    fn test_invalid_forbid_action() {
        expect_err(
            r#"
zones: [{name: z, size: 1m, rate: 1r/s, key: [remote_addr]}]
locations:
  api:
    rules: [{zone: z, forbid_action: fallback}]
"#,
            "invalid forbid_action",
        );
    }

    #[test]
    fn test_status_out_of_range() {
        expect_err("defaults: {status: 302}\nlocations: {api: {}}", "between 400 and 599");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = RulesConfig::from_yaml("zones: []\nbogus: 1").unwrap_err();
        assert!(matches!(err, ZonelimitError::Yaml(_)));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_failed_compile_leaves_registry_untouched() {
        let registry = ZoneRegistry::new();
        RulesConfig::from_yaml(BASIC).unwrap().compile(&registry).unwrap();

        let broken = r#"
zones: [{name: other, size: 1m, rate: 1r/s, key: [uri]}]
locations:
  api:
    rules: [{zone: missing}]
"#;
        assert!(RulesConfig::from_yaml(broken).unwrap().compile(&registry).is_err());
        assert_eq!(registry.names(), vec!["per_ip", "per_key"]);
    }
}
