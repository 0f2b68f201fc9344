use serde::Serialize;

use crate::stats::Timestamp;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipHealth {
    #[default]
    Healthy,
    HalfDead,
    AlmostDead,
    Dead,
}

/// Per-chip bookkeeping. Rebuilt on every chip count.
#[derive(Debug, Clone, Serialize)]
pub struct ChipRecord {
    /// Frequency last requested from the chip (MHz).
    pub frequency: f32,
    /// Frequency the chip reported back, `None` until it answers a set.
    pub frequency_reply: Option<f32>,
    pub last_frequency_reply: Option<Timestamp>,
    pub awaiting_reply: bool,
    pub last_frequency_set: Option<Timestamp>,
    /// Sets issued without a reply since the last one.
    pub frequency_attempts: u32,
    pub last_frequency_adjust: Option<Timestamp>,
    /// Set when the frequency changed and the chip has not been checked since.
    pub frequency_updated: bool,
    pub health: ChipHealth,
    pub previous_health: ChipHealth,
    pub startup: Option<Timestamp>,
    /// Duplicates since the last accepted nonce.
    pub duplicates: u32,
    pub total_duplicates: u64,
    pub last_nonce_value: Option<u32>,
    pub last_nonce: Timestamp,
    pub nonces: u64,
    /// Nominal hashes per second at the current frequency.
    pub hashrate: f64,
    pub fullscan_ms: f64,
    pub fullscan_us: u64,
}

impl ChipRecord {
    pub fn new(frequency: f32, now: Timestamp) -> Self {
        Self {
            frequency,
            frequency_reply: None,
            last_frequency_reply: None,
            awaiting_reply: false,
            last_frequency_set: None,
            frequency_attempts: 0,
            last_frequency_adjust: None,
            frequency_updated: false,
            health: ChipHealth::Healthy,
            previous_health: ChipHealth::Healthy,
            startup: None,
            duplicates: 0,
            total_duplicates: 0,
            last_nonce_value: None,
            last_nonce: now,
            nonces: 0,
            hashrate: 0.0,
            fullscan_ms: 0.0,
            fullscan_us: 0,
        }
    }

    /// Records that a frequency set went out. An earlier set still waiting
    /// for its reply counts as a failed attempt.
    pub fn frequency_sent(&mut self, frequency: f32, now: Timestamp) {
        if self.awaiting_reply {
            self.frequency_attempts += 1;
        }
        self.awaiting_reply = true;
        self.last_frequency_set = Some(now);
        self.frequency = frequency;
        self.frequency_reply = None;
    }

    pub fn frequency_replied(&mut self, frequency: f32, now: Timestamp) {
        self.frequency_reply = Some(frequency);
        self.last_frequency_reply = Some(now);
        self.awaiting_reply = false;
        self.frequency_attempts = 0;
    }

    pub fn set_health(&mut self, health: ChipHealth, now: Timestamp) {
        self.previous_health = self.health;
        self.health = health;
        self.startup = Some(now);
    }

    /// Whether `nonce` repeats the last one accepted from this chip.
    pub fn is_duplicate(&self, nonce: u32) -> bool {
        self.last_nonce_value == Some(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_count_unanswered_sets() {
        let now = Timestamp::from_secs(100);
        let mut chip = ChipRecord::new(200.0, now);

        chip.frequency_sent(205.0, now);
        assert_eq!(chip.frequency_attempts, 0);
        chip.frequency_sent(210.0, now);
        assert_eq!(chip.frequency_attempts, 1);

        chip.frequency_replied(210.0, now);
        assert_eq!(chip.frequency_attempts, 0);
        chip.frequency_sent(215.0, now);
        assert_eq!(chip.frequency_attempts, 0);
        assert_eq!(chip.frequency_reply, None);
    }

    #[test]
    fn should_remember_previous_health() {
        let now = Timestamp::from_secs(100);
        let mut chip = ChipRecord::new(200.0, now);
        chip.set_health(ChipHealth::HalfDead, now);
        assert_eq!(chip.previous_health, ChipHealth::Healthy);
        assert_eq!(chip.health, ChipHealth::HalfDead);
    }
}
