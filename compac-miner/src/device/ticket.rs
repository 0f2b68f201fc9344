//! Ticket mask selection and validation.
//!
//! The ticket mask makes the chips drop results below a difficulty. The
//! driver picks the highest difficulty the chain can sustain, then watches
//! the difficulty of returned nonces to confirm the chips really apply it:
//! a mask set too low lets through nonces below the entry's floor, a mask
//! set too high never produces any nonce close to it.

use serde::Serialize;

/// Nonces ignored after a ticket change while older tasks drain.
pub const TICKET_DELAY: u32 = 8;

/// Nonces below the floor tolerated before the mask is declared too low.
pub const TICKET_BELOW_LIM: u32 = 4;

/// Retries before the controller gives up and settles on the maximum entry.
pub const MAX_TICKET_CHECK: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TicketEntry {
    pub work_diff: u32,
    pub mask: u8,
    /// Nonces after which at least one should have come in below `low_limit`.
    pub nonces_count: u32,
    pub low_limit: f64,
    /// Nonces below this mean the chips pass more than they should.
    pub high_limit: f64,
    /// The entry needs more than this many chips times cores.
    pub chips_x_cores_limit: u32,
}

const fn entry(
    work_diff: u32,
    mask: u8,
    nonces_count: u32,
    low_limit: f64,
    high_limit: f64,
    chips_x_cores_limit: u32,
) -> TicketEntry {
    TicketEntry {
        work_diff,
        mask,
        nonces_count,
        low_limit,
        high_limit,
        chips_x_cores_limit,
    }
}

/// Sorted by descending difficulty.
pub const TICKET_TABLE: [TicketEntry; 7] = [
    entry(64, 0xfc, 20000, 65.9, 63.9, 2600),
    entry(32, 0xf8, 10000, 33.3, 31.9, 1300),
    entry(16, 0xf0, 5000, 16.9, 15.9, 0),
    entry(8, 0xe0, 1250, 8.9, 7.9, 0),
    entry(4, 0xc0, 450, 4.9, 3.9, 0),
    entry(2, 0x80, 150, 2.9, 1.9, 0),
    entry(1, 0x00, 50, 1.9, 0.0, 0),
];

/// Index of the entry for a requested difficulty on a chain with
/// `chips_x_cores` cores. Zero asks for the highest entry the chain allows.
///
/// An entry is usable when the chain exceeds its core limit and has at
/// least as many cores as the entry's difficulty, so a degenerate chain
/// always lands on difficulty 1.
pub fn select(diff: f64, chips_x_cores: u32) -> Option<usize> {
    let diff = if diff == 0.0 { 128.0 } else { diff };
    let wanted = diff.floor();
    TICKET_TABLE.iter().position(|entry| {
        wanted >= f64::from(entry.work_diff)
            && chips_x_cores > entry.chips_x_cores_limit
            && chips_x_cores >= entry.work_diff
    })
}

/// What a validated nonce says about the current ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketVerdict {
    /// Ticket already confirmed, or nothing learned yet.
    Idle,
    Pending,
    Confirmed,
    /// The mask looks wrong; select again.
    Retry,
    /// Too many retries; select again and stop checking.
    GiveUp,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketState {
    /// Difficulty the chips filter at. Zero until a ticket is set.
    pub difficulty: u32,
    pub mask: u8,
    pub number: usize,
    pub last_work_diff: f64,
    /// Nonces seen since the change, the ignored ones included.
    pub work: u32,
    /// Nonces evaluated since the change.
    pub nonces: u64,
    pub below: u32,
    pub validated: bool,
    pub got_low: bool,
    pub failures: u32,
}

impl Default for TicketState {
    fn default() -> Self {
        Self {
            difficulty: 0,
            mask: 0,
            number: TICKET_TABLE.len() - 1,
            last_work_diff: 0.0,
            work: 0,
            nonces: 0,
            below: 0,
            validated: false,
            got_low: false,
            failures: 0,
        }
    }
}

impl TicketState {
    pub fn entry(&self) -> &'static TicketEntry {
        &TICKET_TABLE[self.number.min(TICKET_TABLE.len() - 1)]
    }

    /// Switches to the entry matching `diff`. Returns the entry when the
    /// chips must be told, which is on any change or when `force` is set.
    pub fn apply(&mut self, diff: f64, chips_x_cores: u32, force: bool) -> Option<TicketEntry> {
        let number = select(diff, chips_x_cores)?;
        let entry = TICKET_TABLE[number];
        if !force && self.difficulty == entry.work_diff {
            return None;
        }
        self.difficulty = entry.work_diff;
        self.mask = entry.mask;
        self.number = number;
        self.last_work_diff = diff;
        self.work = 0;
        self.nonces = 0;
        self.below = 0;
        self.validated = false;
        self.got_low = false;
        Some(entry)
    }

    /// Feeds the difficulty of an accepted nonce into validation.
    pub fn check_nonce(&mut self, diff: f64) -> TicketVerdict {
        if self.validated || diff <= 0.0 {
            return TicketVerdict::Idle;
        }
        self.work += 1;
        if self.work <= TICKET_DELAY {
            return TicketVerdict::Pending;
        }
        self.nonces += 1;
        let entry = *self.entry();

        if diff < entry.high_limit {
            self.below += 1;
            if self.below < TICKET_BELOW_LIM {
                return TicketVerdict::Pending;
            }
            return self.fail();
        }

        if diff < entry.low_limit {
            self.got_low = true;
        }

        if self.work >= entry.nonces_count + TICKET_DELAY {
            if self.got_low {
                self.validated = true;
                self.failures = 0;
                return TicketVerdict::Confirmed;
            }
            return self.fail();
        }
        TicketVerdict::Pending
    }

    fn fail(&mut self) -> TicketVerdict {
        if self.failures > MAX_TICKET_CHECK {
            TicketVerdict::GiveUp
        } else {
            self.failures += 1;
            TicketVerdict::Retry
        }
    }

    /// Marks the ticket settled after a give-up, so checking stops.
    pub fn settle(&mut self) {
        self.validated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 0.0, 1; "tiny chain any request")]
    #[test_case(1, 64.0, 1; "tiny chain high request")]
    #[test_case(3000, 0.0, 64; "large chain max request")]
    #[test_case(3000, 20.0, 16; "large chain rounds down")]
    #[test_case(672, 0.0, 16; "single chip caps at sixteen")]
    #[test_case(1400, 0.0, 32; "two chips")]
    #[test_case(672, 3.9, 2; "fractional request floors")]
    fn should_select_entry(cc: u32, diff: f64, expected: u32) {
        let number = select(diff, cc).expect("an entry");
        assert_eq!(TICKET_TABLE[number].work_diff, expected);
    }

    #[test]
    fn should_skip_unforced_reapply() {
        let mut ticket = TicketState::default();
        assert!(ticket.apply(0.0, 672, false).is_some());
        assert!(ticket.apply(0.0, 672, false).is_none());
        assert_eq!(ticket.apply(0.0, 672, true).map(|e| e.mask), Some(0xf0));
    }

    fn ticket_for(work_diff: u32) -> TicketState {
        let mut ticket = TicketState::default();
        ticket.apply(f64::from(work_diff), 672, true);
        assert_eq!(ticket.difficulty, work_diff);
        ticket
    }

    #[test]
    fn should_confirm_when_low_nonces_arrive() {
        let mut ticket = ticket_for(2);
        let count = TICKET_DELAY + ticket.entry().nonces_count;
        let mut last = TicketVerdict::Idle;
        for _ in 0..count {
            last = ticket.check_nonce(2.5);
        }
        assert_eq!(last, TicketVerdict::Confirmed);
        assert!(ticket.validated);
        assert_eq!(ticket.check_nonce(2.5), TicketVerdict::Idle);
    }

    #[test]
    fn should_retry_when_no_low_nonce_arrives() {
        let mut ticket = ticket_for(2);
        let count = TICKET_DELAY + ticket.entry().nonces_count;
        let verdicts: Vec<_> = (0..count).map(|_| ticket.check_nonce(2.9)).collect();
        assert_eq!(verdicts.last(), Some(&TicketVerdict::Retry));
        assert!(!ticket.validated);
        assert_eq!(ticket.failures, 1);
    }

    #[test]
    fn should_retry_on_repeated_nonces_below_floor() {
        let mut ticket = ticket_for(4);
        for _ in 0..TICKET_DELAY {
            assert_eq!(ticket.check_nonce(1.0), TicketVerdict::Pending);
        }
        for _ in 1..TICKET_BELOW_LIM {
            assert_eq!(ticket.check_nonce(1.0), TicketVerdict::Pending);
        }
        assert_eq!(ticket.check_nonce(1.0), TicketVerdict::Retry);
    }

    #[test]
    fn should_give_up_after_repeated_failures() {
        let mut ticket = ticket_for(4);
        ticket.failures = MAX_TICKET_CHECK + 1;
        for _ in 0..TICKET_DELAY + TICKET_BELOW_LIM - 1 {
            ticket.check_nonce(1.0);
        }
        assert_eq!(ticket.check_nonce(1.0), TicketVerdict::GiveUp);
    }
}
