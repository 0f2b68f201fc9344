//! Init-attempt bookkeeping shared by every device on the host.
//!
//! A port that keeps failing bring-up is usually a flapping USB connection.
//! The registry counts consecutive attempts per port so the driver can back
//! off, ask for the port to be reopened, and finally give up on it.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Attempts after which a port is disabled.
pub const MAX_ATTEMPTS: u32 = 10;

/// Every this many attempts the port is reopened instead of retried.
pub const REOPEN_EVERY: u32 = 5;

pub const BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Ready { attempt: u32 },
    /// Retry after sleeping.
    Backoff(Duration),
    /// Close and reopen the port before retrying.
    Reopen,
    Disable { attempts: u32 },
}

#[derive(Debug, Default)]
pub struct PortRegistry {
    attempts: Mutex<HashMap<String, u32>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an init attempt on `port` and decides how to proceed.
    pub fn record_init(&self, port: &str) -> PrepareOutcome {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(port.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if count % REOPEN_EVERY == 0 {
            PrepareOutcome::Reopen
        } else if count > MAX_ATTEMPTS {
            PrepareOutcome::Disable { attempts: count }
        } else if count > 1 {
            PrepareOutcome::Backoff(BACKOFF)
        } else {
            PrepareOutcome::Ready { attempt: count }
        }
    }

    /// Forgets the attempts on `port` after a successful bring-up.
    pub fn clear(&self, port: &str) {
        self.attempts.lock().remove(port);
    }

    pub fn init_count(&self, port: &str) -> u32 {
        self.attempts.lock().get(port).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_escalate_repeated_attempts() {
        let registry = PortRegistry::new();
        let outcomes: Vec<_> = (0..12).map(|_| registry.record_init("ttyUSB0")).collect();

        assert_eq!(outcomes[0], PrepareOutcome::Ready { attempt: 1 });
        assert_eq!(outcomes[1], PrepareOutcome::Backoff(BACKOFF));
        assert_eq!(outcomes[4], PrepareOutcome::Reopen);
        assert_eq!(outcomes[9], PrepareOutcome::Reopen);
        assert_eq!(outcomes[10], PrepareOutcome::Disable { attempts: 11 });
        assert_eq!(outcomes[11], PrepareOutcome::Disable { attempts: 12 });
    }

    #[test]
    fn should_keep_ports_independent() {
        let registry = PortRegistry::new();
        registry.record_init("a");
        registry.record_init("a");
        assert_eq!(registry.record_init("b"), PrepareOutcome::Ready { attempt: 1 });
        assert_eq!(registry.init_count("a"), 2);
    }

    #[test]
    fn should_start_over_after_clear() {
        let registry = PortRegistry::new();
        registry.record_init("a");
        registry.record_init("a");
        registry.clear("a");
        assert_eq!(registry.init_count("a"), 0);
        assert_eq!(registry.record_init("a"), PrepareOutcome::Ready { attempt: 1 });
    }
}
