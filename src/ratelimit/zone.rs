//! Named zones and the registry that owns their tables.
//!
//! A zone is one shared table plus the key attributes and rate every rule
//! referencing it uses. The registry keeps tables alive across reloads when
//! the zone declaration is compatible.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::fixed::Milli;
use super::segment::SegmentSnapshot;
use super::store::ZoneTable;
use crate::error::{Result, ZonelimitError};

/// Validated zone declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSpec {
    pub name: String,
    /// Attribute names forming the composite key, in order.
    pub key_attrs: Vec<String>,
    /// Requests per second ×1000.
    pub rate: u64,
    /// Table byte budget.
    pub size: usize,
}

/// A live zone: declaration plus its locked table.
#[derive(Debug)]
pub struct Zone {
    spec: ZoneSpec,
    table: Arc<Mutex<ZoneTable>>,
    segment: Mutex<Option<SegmentSnapshot>>,
}

impl Zone {
    pub fn new(spec: ZoneSpec) -> Self {
        let table = Arc::new(Mutex::new(ZoneTable::with_capacity(spec.size)));
        Self::with_table(spec, table)
    }

    fn with_table(spec: ZoneSpec, table: Arc<Mutex<ZoneTable>>) -> Self {
        Self {
            spec,
            table,
            segment: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn key_attrs(&self) -> &[String] {
        &self.spec.key_attrs
    }

    pub fn rate(&self) -> u64 {
        self.spec.rate
    }

    pub fn size(&self) -> usize {
        self.spec.size
    }

    pub fn spec(&self) -> &ZoneSpec {
        &self.spec
    }

    /// Lock the table. Callers must not hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, ZoneTable> {
        self.table.lock()
    }

    /// Number of records currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember the latest segment estimator reading.
    pub fn record_segment(&self, snapshot: SegmentSnapshot) {
        *self.segment.lock() = Some(snapshot);
    }

    /// Latest segment estimator reading, if any rule on this zone has one.
    pub fn segment(&self) -> Option<SegmentSnapshot> {
        *self.segment.lock()
    }

    #[cfg(test)]
    fn shares_table_with(&self, other: &Zone) -> bool {
        Arc::ptr_eq(&self.table, &other.table)
    }
}

/// All zones of the running configuration, by name.
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: DashMap<String, Arc<Zone>>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Zone>> {
        self.zones.get(name).map(|z| Arc::clone(z.value()))
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.zones.iter().map(|z| z.key().clone()).collect();
        names.sort();
        names
    }

    /// Build the zones for `specs` without changing the registry.
    ///
    /// A zone whose name, key attributes and size are unchanged keeps its
    /// table and records; a new rate takes effect once committed. A zone whose
    /// key attributes changed is rejected. A resized zone starts with an
    /// empty table.
    pub fn prepare(&self, specs: &[ZoneSpec]) -> Result<Vec<Arc<Zone>>> {
        for spec in specs {
            if let Some(old) = self.zones.get(&spec.name) {
                if old.key_attrs() != spec.key_attrs.as_slice() {
                    return Err(ZonelimitError::config(format!(
                        "zone \"{}\" uses the \"{}\" attributes while previously it used \"{}\"",
                        spec.name,
                        spec.key_attrs.join(","),
                        old.key_attrs().join(",")
                    )));
                }
            }
        }

        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            let zone = match self.get(&spec.name) {
                Some(old) if old.size() == spec.size => {
                    debug!(zone = %spec.name, "Reusing zone table");
                    Zone::with_table(spec.clone(), Arc::clone(&old.table))
                }
                Some(_) => {
                    info!(zone = %spec.name, size = spec.size, "Zone resized, starting empty");
                    Zone::new(spec.clone())
                }
                None => {
                    info!(
                        zone = %spec.name,
                        size = spec.size,
                        rate = %Milli(spec.rate),
                        "Zone created"
                    );
                    Zone::new(spec.clone())
                }
            };
            prepared.push(Arc::new(zone));
        }

        Ok(prepared)
    }

    /// Make `zones` the registry contents. Zones not among them are dropped
    /// once no compiled location references them.
    pub fn commit(&self, zones: &[Arc<Zone>]) {
        self.zones
            .retain(|name, _| zones.iter().any(|zone| zone.name() == name.as_str()));
        for zone in zones {
            self.zones.insert(zone.name().to_string(), Arc::clone(zone));
        }
    }

    /// [`prepare`](Self::prepare) then [`commit`](Self::commit).
    pub fn install(&self, specs: &[ZoneSpec]) -> Result<Vec<Arc<Zone>>> {
        let zones = self.prepare(specs)?;
        self.commit(&zones);
        Ok(zones)
    }
}
