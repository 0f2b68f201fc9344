//! CRC routines for BM1397 frames.
//!
//! Command and response frames carry a CRC-5 in the low bits of their last
//! byte. Responses are checked over a bit count that is not a multiple of
//! eight, so besides the byte-oriented [`crc5`] there is [`crc5_bits`], which
//! walks the register one bit at a time. Task frames carry a CRC-16.

use bitvec::prelude::*;
use crc_all::CrcAlgo;

/// Calculates the CRC-5-USB of whole bytes: polynomial 0x05, initial value
/// 0x1f, no reflection, no output XOR.
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

/// Calculates the same CRC-5 over the first `bits` bits of `data`, most
/// significant bit of each byte first.
///
/// The five register stages are kept as separate bits and folded into the
/// result at the end, so any prefix length works. Asking for more bits than
/// `data` holds covers the whole slice.
pub fn crc5_bits(data: &[u8], bits: usize) -> u8 {
    let mut c = [true; 5];
    for bit in data.view_bits::<Msb0>().iter().by_vals().take(bits) {
        let c1 = c[1];
        c[1] = c[0];
        c[0] = c[4] ^ bit;
        c[4] = c[3];
        c[3] = c[2];
        c[2] = c1 ^ c[0];
    }
    c.iter()
        .enumerate()
        .fold(0, |crc, (stage, &set)| crc | (u8::from(set) << stage))
}

/// Number of bits covered by the CRC of a response frame of `len` bytes:
/// everything after the two-byte preamble up to the CRC field itself.
pub const fn response_crc_bits(len: usize) -> usize {
    8 * (len - 2) - 5
}

/// Checks the CRC of a complete response frame, preamble included.
///
/// The trailing byte holds three status bits above the CRC; frames whose
/// trailing byte exceeds 0x1f are rejected outright.
pub fn response_crc_is_valid(frame: &[u8]) -> bool {
    let Some(&last) = frame.last() else {
        return false;
    };
    frame.len() > 2 && last <= 0x1f && crc5_bits(&frame[2..], response_crc_bits(frame.len())) == last
}

const CRC5_INIT: u8 = 0x1f;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x5,       // polynomial
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);

/// Calculates the CRC-16-CCITT-FALSE used by task frames: polynomial 0x1021,
/// initial value 0xffff, no reflection, no output XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}

const CRC16_INIT: u16 = 0xFFFF;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    false,      // reflect
);
