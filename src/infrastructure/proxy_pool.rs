//! Rotating list of outbound endpoints
//!
//! All workers share one cursor. When several requests fail on the same
//! endpoint at once, only the first report moves the cursor; the others see
//! that it already moved and leave it alone.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::infrastructure::config::{DIRECT_CONNECTION, mask_proxy};

/// One way out to the internet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEndpoint {
    Direct,
    Proxy(String),
}

impl ProxyEndpoint {
    /// Loggable form with credentials removed
    pub fn label(&self) -> String {
        match self {
            Self::Direct => DIRECT_CONNECTION.to_string(),
            Self::Proxy(url) => mask_proxy(url),
        }
    }
}

#[derive(Debug)]
pub struct ProxyPool {
    endpoints: Vec<ProxyEndpoint>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    pub fn from_urls(urls: &[String]) -> Self {
        let mut endpoints: Vec<ProxyEndpoint> = urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| {
                if u.eq_ignore_ascii_case(DIRECT_CONNECTION) {
                    ProxyEndpoint::Direct
                } else {
                    ProxyEndpoint::Proxy(u.to_string())
                }
            })
            .collect();
        if endpoints.is_empty() {
            endpoints.push(ProxyEndpoint::Direct);
        }

        info!(
            "Proxy pool ready with {} endpoint(s): {}",
            endpoints.len(),
            endpoints
                .iter()
                .map(ProxyEndpoint::label)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }

    /// Index of the endpoint new requests should use
    pub fn current(&self) -> usize {
        self.cursor.load(Ordering::Acquire) % self.endpoints.len()
    }

    /// Move past `failed` if it is still the current endpoint.
    ///
    /// Returns the index to use for the next attempt.
    pub fn rotate_from(&self, failed: usize) -> usize {
        let len = self.endpoints.len();
        if len == 1 {
            return 0;
        }
        let next = (failed + 1) % len;
        match self
            .cursor
            .compare_exchange(failed, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                warn!(
                    "Rotating proxy {} -> {}",
                    self.endpoints[failed].label(),
                    self.endpoints[next].label()
                );
                next
            }
            Err(actual) => actual % len,
        }
    }
}
