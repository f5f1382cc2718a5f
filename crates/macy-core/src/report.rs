//! One host's reachability snapshot.

use std::collections::HashMap;
use std::time::Duration;

/// What one host has heard, and how long ago.
///
/// Built fresh for every transmit cycle and discarded after encoding.
/// On the receive side, a decoded Report becomes that peer's row in the
/// transitive view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Reporting host name. At most 255 bytes on the wire.
    pub host: String,

    /// Peer address string → time since the reporting host last heard it.
    pub heard: HashMap<String, Duration>,
}

impl Report {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            heard: HashMap::new(),
        }
    }

    /// Builder-style insert, mostly for tests and fixtures.
    pub fn with_heard(mut self, addr: impl Into<String>, elapsed: Duration) -> Self {
        self.heard.insert(addr.into(), elapsed);
        self
    }
}
