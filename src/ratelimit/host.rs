//! Interfaces to the host request pipeline.
//!
//! The rate limiter never reads requests or sleeps on its own. The host
//! supplies attribute values through [`AttributeSource`], suspends delayed
//! requests through a [`DelayScheduler`], and acts on the returned [`Verdict`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Yields request attributes (client address, API key, header values...).
///
/// `None` means the attribute is not present, which is distinct from an
/// empty value.
pub trait AttributeSource {
    fn attribute(&self, name: &str) -> Option<&[u8]>;
}

impl AttributeSource for HashMap<String, String> {
    fn attribute(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(|v| v.as_bytes())
    }
}

impl AttributeSource for HashMap<String, Vec<u8>> {
    fn attribute(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(|v| v.as_slice())
    }
}

impl<T: AttributeSource + ?Sized> AttributeSource for &T {
    fn attribute(&self, name: &str) -> Option<&[u8]> {
        (**self).attribute(name)
    }
}

/// Suspends a request without blocking the worker.
#[async_trait]
pub trait DelayScheduler: Send + Sync {
    /// Resume after `delay` has elapsed.
    async fn delay(&self, delay: Duration);
}

/// Delays requests on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl DelayScheduler for TokioDelay {
    async fn delay(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// What to do with a request that was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum ForbidAction {
    /// Hand the request to a named location (`@name`)
    NamedLocation(String),
    /// Internally redirect to a URI, keeping the query arguments
    Redirect(String),
}

impl ForbidAction {
    /// Parse an `@name` or `/uri` target.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() < 2 {
            return None;
        }
        match value.as_bytes()[0] {
            b'@' => Some(ForbidAction::NamedLocation(value.to_string())),
            b'/' => Some(ForbidAction::Redirect(value.to_string())),
            _ => None,
        }
    }
}

/// Aggregate decision over every rule of a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Let the request through untouched.
    Pass,
    /// Let the request through after `delay_ms`.
    Delay {
        delay_ms: u64,
        zone: String,
    },
    /// Refuse the request with `status`, or with `action` when one is configured.
    Reject {
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<ForbidAction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject { .. })
    }

    /// The delay to apply before letting the request through, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Verdict::Delay { delay_ms, .. } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }
}
