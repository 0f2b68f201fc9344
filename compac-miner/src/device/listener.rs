//! Receive stream parser.
//!
//! One thread reads the serial port for the life of the device. What a
//! frame means depends on the protocol state: during chip count it is a
//! chip announcing itself, while mining it is a nonce or a PLL read-back.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::chip::ChipRecord;
use super::nonce::NonceCandidate;
use super::{Device, MiningState};
use crate::asic::bm1397::protocol::{Command, FrameCodec, RawFrame, register};
use crate::stats::Timestamp;
use crate::tracing::prelude::*;

/// How long chips get to answer the chip-count request.
const CHIP_COUNT_TIMEOUT_MS: u64 = 1000;

const READ_CHUNK: usize = 512;

/// Fewer buffered bytes than this after decoding settles the chip count.
const CHIP_COUNT_SETTLE_LEFTOVER: usize = 6;

/// Where a received frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRoute {
    ChipIdentity,
    /// A non-identity frame ended the chip count.
    CountSettled,
    FrequencyReply,
    NonceQueued,
    Dropped,
}

impl Device {
    pub(crate) fn run_listener(&self) {
        let mut codec = FrameCodec::new(self.family.response_len());
        let mut buf = BytesMut::with_capacity(4 * READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        while !self.is_shutdown() {
            let mut state = self.state();
            let mut timeout = self.read_timeout();
            if state == MiningState::ChipCount {
                buf.clear();
                self.send(Command::read_all(register::CHIP_ADDRESS));
                self.state
                    .transition(MiningState::ChipCount, MiningState::ChipCountXx);
                state = self.state();
                timeout = std::time::Duration::from_millis(CHIP_COUNT_TIMEOUT_MS);
            }

            let read = match self.transport().read(&mut chunk, timeout) {
                Ok(read) => read,
                Err(e) => {
                    if !self.is_shutdown() && state != MiningState::Reset {
                        warn!(port = self.port(), error = %e, "Read failed, resetting");
                        self.set_state(MiningState::Reset);
                    }
                    self.pause_ms(self.config.read_timeout_ms);
                    continue;
                }
            };
            buf.extend_from_slice(&chunk[..read]);

            let now = Timestamp::now();
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        self.handle_frame(frame, now);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(port = self.port(), error = %e, "Decoder error, dropping buffer");
                        buf.clear();
                        break;
                    }
                }
            }

            // A partial frame may still be arriving; only a short leftover
            // or a silent read ends the count.
            if self.state() == MiningState::ChipCountXx
                && (read == 0 || buf.len() < CHIP_COUNT_SETTLE_LEFTOVER)
            {
                self.settle_chip_count();
            }
        }
        debug!(port = self.port(), "Listener exiting");
    }

    /// Routes one frame according to the current state.
    pub(crate) fn handle_frame(&self, frame: RawFrame, now: Timestamp) -> FrameRoute {
        let state = self.state();
        match state {
            MiningState::ChipCountXx => self.chip_count_frame(frame, now),
            MiningState::Mining | MiningState::MiningDups => {
                if self.consume_frequency_reply(&frame, now) {
                    return FrameRoute::FrequencyReply;
                }
                let candidate = NonceCandidate {
                    frame: frame.bytes,
                    when: now,
                };
                if self.nonces.push(candidate) {
                    FrameRoute::NonceQueued
                } else {
                    debug!(port = self.port(), "Nonce queue full, dropping frame");
                    FrameRoute::Dropped
                }
            }
            _ => {
                if self.consume_frequency_reply(&frame, now) {
                    FrameRoute::FrequencyReply
                } else {
                    FrameRoute::Dropped
                }
            }
        }
    }

    fn chip_count_frame(&self, frame: RawFrame, now: Timestamp) -> FrameRoute {
        if self.family.is_chip_identity(&frame.bytes) {
            let chips = {
                let mut inner = self.inner.lock();
                let frequency = inner.freq.default;
                inner.chips.push(ChipRecord::new(frequency, now));
                inner.chips.len()
            };
            info!(port = self.port(), chip = chips - 1, "Chip detected");
            self.hashrate.lock().set_chip_count(chips);
            self.update_rates();
            return FrameRoute::ChipIdentity;
        }

        if self.chips_known() {
            self.set_state(MiningState::ChipCountOk);
            self.clear_registry();
            self.consume_frequency_reply(&frame, now);
            FrameRoute::CountSettled
        } else {
            warn!(port = self.port(), "Unexpected frame before any chip, resetting");
            self.set_state(MiningState::Reset);
            FrameRoute::Dropped
        }
    }

    /// The chain went quiet after the chip-count request.
    fn settle_chip_count(&self) {
        let chips = self.inner.lock().chips.len();
        if chips < self.config.expected_chips {
            warn!(
                port = self.port(),
                chips,
                expected = self.config.expected_chips,
                "Too few chips, resetting"
            );
            self.set_state(MiningState::Reset);
        } else {
            info!(port = self.port(), chips, "Chip count settled");
            self.set_state(MiningState::ChipCountOk);
            self.clear_registry();
        }
    }

    fn consume_frequency_reply(&self, frame: &RawFrame, now: Timestamp) -> bool {
        if !frame.crc_ok {
            return false;
        }
        match frame.response().pll_reply() {
            Some((address, dividers)) => self.frequency_reply(address, dividers, now),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use super::*;
    use crate::device::tests::{fixture, with_chips};

    const IDENTITY: [u8; 9] = [0xaa, 0x55, 0x13, 0x97, 0x18, 0x00, 0x00, 0x00, 0x06];
    const PLL_REPLY: [u8; 9] = [0xaa, 0x55, 0x40, 0xa0, 0x02, 0x25, 0x00, 0x08, 0x1a];
    const NONCE: [u8; 9] = [0xaa, 0x55, 0x7c, 0x2b, 0xac, 0x1d, 0x00, 0x10, 0x05];

    fn raw(bytes: &[u8], crc_ok: bool) -> RawFrame {
        RawFrame {
            bytes: Bytes::copy_from_slice(bytes),
            crc_ok,
            span: bytes.len(),
        }
    }

    fn wait_for(device: &Device, state: MiningState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if device.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn should_count_chips_until_other_traffic() {
        let f = fixture();
        f.device.set_state(MiningState::ChipCountXx);
        let now = Timestamp::now();

        assert_eq!(f.device.handle_frame(raw(&IDENTITY, true), now), FrameRoute::ChipIdentity);
        assert_eq!(f.device.handle_frame(raw(&IDENTITY, true), now), FrameRoute::ChipIdentity);
        assert_eq!(f.device.inner.lock().chips.len(), 2);
        assert_eq!(f.device.hashrate.lock().chip_count(), 2);

        assert_eq!(f.device.handle_frame(raw(&NONCE, true), now), FrameRoute::CountSettled);
        assert_eq!(f.device.state(), MiningState::ChipCountOk);
    }

    #[test]
    fn should_reset_on_noise_before_first_chip() {
        let f = fixture();
        f.device.set_state(MiningState::ChipCountXx);
        assert_eq!(
            f.device.handle_frame(raw(&NONCE, false), Timestamp::now()),
            FrameRoute::Dropped
        );
        assert_eq!(f.device.state(), MiningState::Reset);
    }

    #[test]
    fn should_queue_nonces_while_mining_even_with_bad_crc() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.set_state(MiningState::MiningDups);
        assert_eq!(
            f.device.handle_frame(raw(&NONCE, false), Timestamp::now()),
            FrameRoute::NonceQueued
        );
        assert_eq!(f.device.nonces.len(), 1);
    }

    #[test]
    fn should_consume_frequency_replies() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.inner.lock().chips[0].awaiting_reply = true;
        f.device.set_state(MiningState::Mining);

        assert_eq!(
            f.device.handle_frame(raw(&PLL_REPLY, true), Timestamp::now()),
            FrameRoute::FrequencyReply
        );
        assert!(f.device.nonces.is_empty());
        let inner = f.device.inner.lock();
        assert!(!inner.chips[0].awaiting_reply);
        assert_eq!(inner.chips[0].frequency_reply, Some(200.0));
    }

    #[test]
    fn should_ignore_nonces_outside_mining() {
        let f = fixture();
        f.device.set_state(MiningState::OpenCore);
        assert_eq!(
            f.device.handle_frame(raw(&NONCE, true), Timestamp::now()),
            FrameRoute::Dropped
        );
        assert!(f.device.nonces.is_empty());
    }

    #[test]
    fn should_run_chip_count_over_transport() {
        let f = fixture();
        f.transport.push_incoming(&IDENTITY);
        f.device.set_state(MiningState::ChipCount);

        let device = f.device.clone();
        let listener = thread::spawn(move || device.run_listener());

        assert!(wait_for(&f.device, MiningState::ChipCountOk));
        f.device.set_state(MiningState::Shutdown);
        listener.join().expect("listener");

        assert_eq!(f.device.inner.lock().chips.len(), 1);
        assert_eq!(
            f.transport.written()[0],
            vec![0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]
        );
    }

    #[test]
    fn should_count_chip_whose_identity_arrives_split() {
        let f = fixture();
        f.transport.push_incoming(&IDENTITY[..7]);
        f.transport.push_incoming(&IDENTITY[7..]);
        f.device.set_state(MiningState::ChipCount);

        let device = f.device.clone();
        let listener = thread::spawn(move || device.run_listener());

        assert!(wait_for(&f.device, MiningState::ChipCountOk));
        f.device.set_state(MiningState::Shutdown);
        listener.join().expect("listener");

        assert_eq!(f.device.inner.lock().chips.len(), 1);
    }

    #[test]
    fn should_reset_when_chain_stays_silent() {
        let f = fixture();
        f.device.set_state(MiningState::ChipCount);

        let device = f.device.clone();
        let listener = thread::spawn(move || device.run_listener());

        assert!(wait_for(&f.device, MiningState::Reset));
        f.device.set_state(MiningState::Shutdown);
        listener.join().expect("listener");
    }
}
