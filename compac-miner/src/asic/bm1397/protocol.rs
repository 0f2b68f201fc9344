//! BM1397 wire format.
//!
//! Host to chip, every frame starts with `55 aa`. Commands end in a byte
//! whose low five bits hold a CRC-5 of the preceding payload; task frames
//! end in a big-endian CRC-16. Chip to host, every frame is
//! [`RESPONSE_LEN`] bytes starting with `aa 55`:
//!
//! ```text
//!  0  1  2  3  4  5  6     7     8
//! aa 55 d0 d1 d2 d3 addr  tag   status|crc5
//! ```
//!
//! For register replies `d0..d3` is the register value, `addr` the replying
//! chip and `tag` the register. For nonces `d0..d3` is the nonce, big
//! endian, and `tag` the job id with the midstate index in its low two bits.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::RESPONSE_LEN;
use super::crc::{crc5_bits, crc16, response_crc_is_valid};
use crate::asic::PllDividers;
use crate::tracing::prelude::*;

pub const COMMAND_PREAMBLE: [u8; 2] = [0x55, 0xaa];
pub const RESPONSE_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// Register addresses used by the driver.
pub mod register {
    pub const CHIP_ADDRESS: u8 = 0x00;
    pub const PLL0_PARAMETER: u8 = 0x08;
    pub const TICKET_MASK: u8 = 0x14;
    pub const MISC_CONTROL: u8 = 0x18;
    pub const ORDERED_CLOCK_ENABLE: u8 = 0x20;
    pub const FAST_UART_CONFIGURATION: u8 = 0x28;
    pub const CORE_REGISTER_CONTROL: u8 = 0x3c;
    pub const PLL3_PARAMETER: u8 = 0x68;
    pub const PLL0_DIVIDER: u8 = 0x70;
    pub const CLOCK_ORDER_CONTROL0: u8 = 0x80;
    pub const CLOCK_ORDER_CONTROL1: u8 = 0x84;
}

mod opcode {
    pub const SET_CHIP_ADDRESS: u8 = 0x40;
    pub const WRITE_REGISTER: u8 = 0x41;
    pub const READ_REGISTER: u8 = 0x42;
    pub const CHAIN_INACTIVE: u8 = 0x53;
    pub const TASK: u8 = 0x21;

    /// Set on command opcodes addressed to every chip.
    pub const BROADCAST: u8 = 0x10;
}

/// Divider value written to [`register::PLL0_DIVIDER`] ahead of a frequency
/// change.
pub const PLL0_DIVIDER_VALUE: [u8; 4] = [0x0f, 0x0f, 0x0f, 0x00];

/// Host to chip command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ReadRegister {
        broadcast: bool,
        chip_address: u8,
        register: u8,
    },
    WriteRegister {
        broadcast: bool,
        chip_address: u8,
        register: u8,
        value: [u8; 4],
    },
    SetChipAddress {
        chip_address: u8,
    },
    ChainInactive,
    Task(Task),
}

impl Command {
    pub fn write_all(register: u8, value: [u8; 4]) -> Self {
        Command::WriteRegister {
            broadcast: true,
            chip_address: 0,
            register,
            value,
        }
    }

    pub fn read_all(register: u8) -> Self {
        Command::ReadRegister {
            broadcast: true,
            chip_address: 0,
            register,
        }
    }

    pub fn ticket_mask(mask: u8) -> Self {
        Self::write_all(register::TICKET_MASK, [0, 0, 0, mask])
    }

    /// PLL0 write for one chip, or every chip when `chip_address` is `None`.
    pub fn pll(chip_address: Option<u8>, dividers: PllDividers) -> Self {
        Command::WriteRegister {
            broadcast: chip_address.is_none(),
            chip_address: chip_address.unwrap_or(0),
            register: register::PLL0_PARAMETER,
            value: [
                0x40,
                dividers.fb_div,
                dividers.ref_div,
                (dividers.post_div1 << 4) | (dividers.post_div2 & 0x0f),
            ],
        }
    }

    pub fn pll_divider(chip_address: Option<u8>) -> Self {
        Command::WriteRegister {
            broadcast: chip_address.is_none(),
            chip_address: chip_address.unwrap_or(0),
            register: register::PLL0_DIVIDER,
            value: PLL0_DIVIDER_VALUE,
        }
    }

    /// Payload of a CRC-5 command, trailing CRC byte included but still zero.
    fn payload(&self) -> Option<Vec<u8>> {
        let with = |op: u8, broadcast: bool| if broadcast { op | opcode::BROADCAST } else { op };
        let payload = match self {
            Command::ReadRegister {
                broadcast,
                chip_address,
                register,
            } => vec![
                with(opcode::READ_REGISTER, *broadcast),
                0x05,
                *chip_address,
                *register,
                0x00,
            ],
            Command::WriteRegister {
                broadcast,
                chip_address,
                register,
                value,
            } => {
                let mut payload = vec![
                    with(opcode::WRITE_REGISTER, *broadcast),
                    0x09,
                    *chip_address,
                    *register,
                ];
                payload.extend_from_slice(value);
                payload.push(0x00);
                payload
            }
            Command::SetChipAddress { chip_address } => {
                vec![opcode::SET_CHIP_ADDRESS, 0x05, *chip_address, 0x00, 0x00]
            }
            Command::ChainInactive => vec![opcode::CHAIN_INACTIVE, 0x05, 0x00, 0x00, 0x00],
            Command::Task(_) => return None,
        };
        Some(payload)
    }
}

/// Frames `payload` behind the command preamble and ORs the CRC-5 of its
/// first `crc_bits` bits into the last byte. The CRC is taken over the
/// caller's payload, not the framed copy.
pub fn encode_frame(payload: &[u8], crc_bits: usize, dst: &mut BytesMut) {
    dst.reserve(COMMAND_PREAMBLE.len() + payload.len());
    dst.put_slice(&COMMAND_PREAMBLE);
    dst.put_slice(payload);
    if !payload.is_empty() {
        let last = dst.len() - 1;
        dst[last] |= crc5_bits(payload, crc_bits);
    }
}

/// One mining task, or an idle filler when it carries no work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub job_id: u8,
    /// Midstate count announced to the chip.
    pub midstate_count: u8,
    /// Frame body length, CRC included.
    pub len: usize,
    /// Last twelve header bytes: merkle root tail, time and bits.
    pub header_tail: Option<[u8; 12]>,
    pub midstates: Vec<[u8; 32]>,
}

impl Task {
    /// Filler task: all-ones header tail and no midstates. Used while cores
    /// warm up and when no work is available.
    pub fn idle(job_id: u8, midstate_count: u8, len: usize) -> Self {
        Task {
            job_id,
            midstate_count,
            len,
            header_tail: None,
            midstates: Vec::new(),
        }
    }

    /// Frame body, CRC-16 included. Header tail and midstates go on the wire
    /// byte-reversed.
    pub fn body(&self) -> BytesMut {
        let len = self.len.max(super::TASK_LEN);
        let mut body = BytesMut::zeroed(len);
        body[0] = opcode::TASK;
        body[1] = len as u8;
        body[2] = self.job_id;
        body[3] = self.midstate_count;

        match &self.header_tail {
            Some(tail) => reverse_into(&mut body[8..20], tail),
            None => body[8..20].fill(0xff),
        }

        for (i, midstate) in self.midstates.iter().enumerate() {
            let start = 20 + 32 * i;
            if start + 32 > len - 2 {
                break;
            }
            reverse_into(&mut body[start..start + 32], midstate);
        }

        let crc = crc16(&body[..len - 2]);
        body[len - 2..].copy_from_slice(&crc.to_be_bytes());
        body
    }
}

fn reverse_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
        *d = *s;
    }
}

/// A fixed-length frame cut from the receive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub bytes: Bytes,
    pub crc_ok: bool,
    /// Distance to the next preamble seen in the buffer, or the bytes
    /// available, whichever comes first. Longer than the frame when trailing
    /// garbage followed it.
    pub span: usize,
}

impl RawFrame {
    pub fn response(&self) -> Response<'_> {
        Response(&self.bytes)
    }
}

/// Field accessors over a response frame.
#[derive(Debug, Clone, Copy)]
pub struct Response<'a>(pub &'a [u8]);

impl Response<'_> {
    fn byte(&self, i: usize) -> u8 {
        self.0.get(i).copied().unwrap_or(0)
    }

    pub fn value(&self) -> [u8; 4] {
        [self.byte(2), self.byte(3), self.byte(4), self.byte(5)]
    }

    pub fn nonce(&self) -> u32 {
        u32::from_be_bytes(self.value())
    }

    pub fn chip_address(&self) -> u8 {
        self.byte(6)
    }

    pub fn tag(&self) -> u8 {
        self.byte(7)
    }

    pub fn job_id(&self) -> u8 {
        self.tag()
    }

    /// Nonce byte the chips split their search space on.
    pub fn nonce_byte(&self) -> u8 {
        self.byte(3)
    }

    /// Byte that attributes a nonce to a chip when no nonce-byte map is
    /// known for the chain.
    pub fn fallback_chip_byte(&self) -> u8 {
        self.byte(4)
    }

    /// PLL0 register reply: the replying chip address and its dividers.
    pub fn pll_reply(&self) -> Option<(u8, PllDividers)> {
        if self.0.len() != RESPONSE_LEN || self.tag() != register::PLL0_PARAMETER {
            return None;
        }
        let fc = self.byte(5);
        let dividers = PllDividers {
            fb_div: self.byte(3),
            ref_div: self.byte(4),
            post_div1: fc >> 4,
            post_div2: fc & 0x0f,
        };
        (dividers.ref_div > 0 && dividers.post_div1 > 0 && dividers.post_div2 > 0)
            .then_some((self.chip_address(), dividers))
    }
}

/// Encoder for commands and tasks, decoder for the response stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    response_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(RESPONSE_LEN)
    }
}

impl FrameCodec {
    pub fn new(response_len: usize) -> Self {
        Self {
            response_len: response_len.max(RESPONSE_PREAMBLE.len() + 1),
        }
    }

    /// Encodes a command into a fresh buffer.
    pub fn frame(command: &Command) -> Bytes {
        let mut dst = BytesMut::new();
        encode_command(command, &mut dst);
        dst.freeze()
    }
}

fn encode_command(command: &Command, dst: &mut BytesMut) {
    match command {
        Command::Task(task) => {
            dst.put_slice(&COMMAND_PREAMBLE);
            dst.put_slice(&task.body());
        }
        other => {
            if let Some(payload) = other.payload() {
                encode_frame(&payload, 8 * (payload.len() - 1), dst);
            }
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        encode_command(&command, dst);
        trace!(frame = %hex::encode(&dst[start..]), "TX");
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = io::Error;

    // Once aligned on a preamble, the next response_len bytes are a frame,
    // valid or not. Bytes that cannot start a frame are dropped up to the
    // next preamble, or entirely when none is in sight.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = self.response_len;
        if src.len() < len {
            return Ok(None);
        }

        if !src.starts_with(&RESPONSE_PREAMBLE) {
            match find_preamble(src, 1) {
                Some(start) => {
                    trace!(skipped = start, "RX resync");
                    src.advance(start);
                }
                None => {
                    trace!(discarded = src.len(), "RX no preamble");
                    src.clear();
                    return Ok(None);
                }
            }
            if src.len() < len {
                return Ok(None);
            }
        }

        let span = find_preamble(src, len).unwrap_or(src.len());
        let bytes = src.split_to(len).freeze();
        let crc_ok = response_crc_is_valid(&bytes);
        trace!(frame = %hex::encode(&bytes), crc_ok, span, "RX");
        Ok(Some(RawFrame {
            bytes,
            crc_ok,
            span,
        }))
    }
}

/// Position of the next response preamble at or after `from`. A lone first
/// preamble byte at the very end of the buffer counts, since its partner may
/// still be in flight.
fn find_preamble(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find(|&i| {
        buf[i] == RESPONSE_PREAMBLE[0]
            && buf.get(i + 1).is_none_or(|&next| next == RESPONSE_PREAMBLE[1])
    })
}
