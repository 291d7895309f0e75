use log::{info, warn};

use crate::{clock::Millis, error::ConnectError, types::LinkState};

/// Network link below the MQTT session: WiFi association or Ethernet/DHCP.
pub trait Transport {
    fn connect(&mut self) -> Result<(), ConnectError>;
    fn is_connected(&self) -> bool;
    fn local_address(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    pub retry_delay_ms: u32,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay_ms: 500,
        }
    }
}

/// Keeps the transport up. Publishes nothing; the session layer reads
/// [`LinkState`] from [`tick`](Self::tick).
#[derive(Debug)]
pub struct ConnectivitySupervisor<T> {
    transport: T,
    policy: AttemptPolicy,
    state: LinkState,
    last_attempt: Option<Millis>,
    failures: u32,
    exhausted: bool,
    connected_since: Option<Millis>,
}

impl<T: Transport> ConnectivitySupervisor<T> {
    pub fn new(transport: T, policy: AttemptPolicy) -> Self {
        Self {
            transport,
            policy,
            state: LinkState::Disconnected,
            last_attempt: None,
            failures: 0,
            exhausted: false,
            connected_since: None,
        }
    }

    pub fn tick(&mut self, now: Millis) -> LinkState {
        if self.state == LinkState::Connected {
            if self.transport.is_connected() {
                return self.state;
            }
            warn!("link lost");
            self.state = LinkState::Disconnected;
            self.connected_since = None;
        }

        let retry_due = self
            .last_attempt
            .map_or(true, |last| now.has_elapsed(last, self.policy.retry_delay_ms));
        if !retry_due {
            return self.state;
        }

        self.state = LinkState::Connecting;
        self.last_attempt = Some(now);
        match self.transport.connect() {
            Ok(()) => {
                info!(
                    "link up after {} failed attempt(s), address {}",
                    self.failures,
                    self.transport.local_address()
                );
                self.state = LinkState::Connected;
                self.failures = 0;
                self.connected_since = Some(now);
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                self.failures += 1;
                warn!(
                    "connect attempt {}/{} failed: {err}",
                    self.failures, self.policy.max_attempts
                );
                if self.failures >= self.policy.max_attempts {
                    self.exhausted = true;
                    self.failures = 0;
                }
            }
        }
        self.state
    }

    /// True once after `max_attempts` consecutive failures.
    pub fn take_exhausted(&mut self) -> bool {
        core::mem::take(&mut self.exhausted)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn connected_since(&self) -> Option<Millis> {
        self.connected_since
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
