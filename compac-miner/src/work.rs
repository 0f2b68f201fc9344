//! Work items and the upstream work source.
//!
//! A [`Work`] is an 80-byte block header plus the SHA-256 midstates the chip
//! starts from. With version rolling a work item carries up to four header
//! versions, one midstate each, and the chip reports which one a nonce
//! belongs to in the low bits of the job id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

/// Header size of a Bitcoin block.
pub const HEADER_LEN: usize = 80;

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    header: [u8; HEADER_LEN],
    versions: Vec<u32>,
    midstates: Vec<[u8; 32]>,
}

impl Work {
    pub fn new(header: [u8; HEADER_LEN]) -> Self {
        Self::with_versions(header, &[])
    }

    /// Work whose header may be hashed with each of `versions`; the first
    /// entry is the header as given. At most four are kept. With no versions
    /// the header's own is used.
    pub fn with_versions(header: [u8; HEADER_LEN], versions: &[u32]) -> Self {
        let mut versions: Vec<u32> = versions.iter().copied().take(4).collect();
        if versions.is_empty() {
            versions.push(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
        }
        let midstates = versions
            .iter()
            .map(|&version| midstate(&versioned(&header, version)))
            .collect();
        Self {
            header,
            versions,
            midstates,
        }
    }

    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    /// Header bytes 64..76: merkle root tail, time and bits.
    pub fn header_tail(&self) -> [u8; 12] {
        let mut tail = [0; 12];
        tail.copy_from_slice(&self.header[64..76]);
        tail
    }

    pub fn midstates(&self) -> &[[u8; 32]] {
        &self.midstates
    }

    pub fn versions(&self) -> &[u32] {
        &self.versions
    }

    /// Whether the work offers version-rolled midstates for AsicBoost.
    pub fn rolls_version(&self) -> bool {
        self.versions.len() > 1
    }

    /// Hashes the header with `nonce` under version `midstate`. Returns the
    /// share difficulty when the hash meets difficulty 1.
    pub fn test_nonce(&self, nonce: u32, midstate: usize) -> Option<f64> {
        let version = *self.versions.get(midstate)?;
        let mut header = versioned(&self.header, version);
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        let hash = Sha256::digest(Sha256::digest(header));
        if hash[28..32] != [0, 0, 0, 0] {
            return None;
        }
        Some(share_difficulty(&hash))
    }
}

fn versioned(header: &[u8; HEADER_LEN], version: u32) -> [u8; HEADER_LEN] {
    let mut header = *header;
    header[..4].copy_from_slice(&version.to_le_bytes());
    header
}

/// SHA-256 state after the first 64 header bytes, words big-endian.
pub fn midstate(header: &[u8; HEADER_LEN]) -> [u8; 32] {
    let mut state = SHA256_IV;
    let block = GenericArray::clone_from_slice(&header[..64]);
    sha2::compress256(&mut state, &[block]);
    let mut out = [0; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Difficulty of a double-SHA-256 hash, read as a little-endian integer.
pub fn share_difficulty(hash: &[u8]) -> f64 {
    let value = hash.iter().rev().fold(0.0, |acc, &b| acc * 256.0 + f64::from(b));
    if value == 0.0 {
        f64::INFINITY
    } else {
        // Difficulty 1 is a target of 0xffff << 208.
        65535.0 * 2f64.powi(208) / value
    }
}

/// A nonce the device found and the driver verified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub nonce: u32,
    pub midstate: usize,
    pub version: u32,
    pub share_difficulty: f64,
    /// Ticket difficulty the chips were filtering at.
    pub device_difficulty: u32,
}

/// Upstream collaborator that supplies work and takes results.
pub trait WorkSource: Send + Sync {
    /// Next queued work item, if any is ready.
    fn next_work(&self) -> Option<Work>;

    /// A work item left the device; no more nonces will be matched to it.
    fn work_completed(&self, work: Arc<Work>) {
        drop(work);
    }

    /// Submits a verified nonce. Returns whether upstream accepted it.
    fn submit(&self, work: &Work, solution: &Solution) -> bool;

    /// Whether the pool is currently connected.
    fn pool_active(&self) -> bool;

    /// Reports hashes done since the last report.
    fn hashes_done(&self, _hashes: u64) {}

    fn hardware_error(&self) {}
}

/// Work source for burn-in runs: endless synthetic headers, every valid
/// nonce accepted.
#[derive(Debug)]
pub struct BurnInSource {
    counter: AtomicU64,
    accepted: AtomicU64,
    hashes: AtomicU64,
    rolling: bool,
}

/// Bits that may be rolled in the header version.
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

impl BurnInSource {
    pub fn new(rolling: bool) -> Self {
        Self {
            counter: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            hashes: AtomicU64::new(0),
            rolling,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn hashes(&self) -> u64 {
        self.hashes.load(Ordering::Relaxed)
    }
}

impl WorkSource for BurnInSource {
    fn next_work(&self) -> Option<Work> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut header = [0u8; HEADER_LEN];
        let version: u32 = 0x2000_0000;
        header[..4].copy_from_slice(&version.to_le_bytes());
        let merkle = Sha256::digest(n.to_le_bytes());
        header[36..68].copy_from_slice(&merkle);
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as u32);
        header[68..72].copy_from_slice(&time.to_le_bytes());
        header[72..76].copy_from_slice(&0x1d00_ffffu32.to_le_bytes());

        if self.rolling {
            let versions: Vec<u32> = (0..4u32)
                .map(|i| version | ((i << 13) & VERSION_ROLLING_MASK))
                .collect();
            Some(Work::with_versions(header, &versions))
        } else {
            Some(Work::new(header))
        }
    }

    fn submit(&self, _work: &Work, _solution: &Solution) -> bool {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn pool_active(&self) -> bool {
        true
    }

    fn hashes_done(&self, hashes: u64) {
        self.hashes.fetch_add(hashes, Ordering::Relaxed);
    }
}
