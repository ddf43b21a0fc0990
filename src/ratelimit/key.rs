//! Composite key generation and hashing.

use std::fmt;

use super::host::AttributeSource;

/// Longest value accepted for a single key component.
pub const MAX_COMPONENT_LEN: usize = 65535;

/// CRC-32 (IEEE) lookup table, reflected polynomial.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let polynomial: u32 = 0xEDB8_8320;
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ polynomial;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Incremental CRC-32 over the key components.
#[derive(Clone, Debug)]
pub struct KeyHasher {
    crc: u32,
}

impl KeyHasher {
    pub const fn new() -> Self {
        Self { crc: !0u32 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.crc ^ byte as u32) & 0xFF) as usize;
            self.crc = (self.crc >> 8) ^ CRC32_TABLE[index];
        }
    }

    pub fn finish(self) -> u32 {
        !self.crc
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a composite key could not be built for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The attribute is not present on the request
    Missing(String),
    /// The attribute is present but empty
    Empty(String),
    /// The attribute value exceeds [`MAX_COMPONENT_LEN`]
    Oversized { name: String, len: usize },
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Missing(name) => write!(f, "the \"{}\" attribute is not set", name),
            KeyError::Empty(name) => write!(f, "the \"{}\" attribute is empty", name),
            KeyError::Oversized { name, len } => write!(
                f,
                "the value of the \"{}\" attribute is more than {} bytes: {}",
                name, MAX_COMPONENT_LEN, len
            ),
        }
    }
}

/// The serialized key of one record: all component values concatenated in
/// configuration order, plus their CRC-32.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    hash: u32,
    bytes: Vec<u8>,
}

impl CompositeKey {
    /// Build the key for a request from the configured attribute names.
    pub fn build<S>(attributes: &[String], source: &S) -> Result<Self, KeyError>
    where
        S: AttributeSource + ?Sized,
    {
        let mut hasher = KeyHasher::new();
        let mut bytes = Vec::new();

        for name in attributes {
            let value = source
                .attribute(name)
                .ok_or_else(|| KeyError::Missing(name.clone()))?;

            if value.is_empty() {
                return Err(KeyError::Empty(name.clone()));
            }

            if value.len() > MAX_COMPONENT_LEN {
                return Err(KeyError::Oversized {
                    name: name.clone(),
                    len: value.len(),
                });
            }

            hasher.update(value);
            bytes.extend_from_slice(value);
        }

        Ok(Self {
            hash: hasher.finish(),
            bytes,
        })
    }

    /// Build a key directly from component values.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = KeyHasher::new();
        let mut bytes = Vec::new();
        for part in parts {
            hasher.update(part);
            bytes.extend_from_slice(part);
        }
        Self {
            hash: hasher.finish(),
            bytes,
        }
    }

    /// Build a key with an explicit hash; used to force collisions in tests.
    #[cfg(test)]
    pub(crate) fn with_hash(hash: u32, bytes: &[u8]) -> Self {
        Self {
            hash,
            bytes: bytes.to_vec(),
        }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{}", self.hash, String::from_utf8_lossy(&self.bytes))
    }
}
