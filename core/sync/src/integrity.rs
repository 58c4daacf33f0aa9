//! Payload checksums and corruption detection.
//!
//! A [`Checksum`] pairs a whole-payload digest with per-block CRC32 values, so
//! a mismatch can be graded: the corruption level is the share of blocks that
//! no longer match.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use offsync_common::{Error, Result};

use crate::record::{payload_bytes, OfflineRecord};

/// Default block size for per-block digests.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Pluggable whole-payload digest.
pub trait PayloadDigest: Send + Sync {
    /// Algorithm name stored alongside the digest.
    fn name(&self) -> &str;

    /// Hex digest of the given bytes.
    fn digest(&self, data: &[u8]) -> String;
}

/// BLAKE2b with a 256-bit output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake2bDigest;

impl PayloadDigest for Blake2bDigest {
    fn name(&self) -> &str {
        "blake2b-256"
    }

    fn digest(&self, data: &[u8]) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

/// CRC32, cheap but not collision resistant.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32Digest;

impl PayloadDigest for Crc32Digest {
    fn name(&self) -> &str {
        "crc32"
    }

    fn digest(&self, data: &[u8]) -> String {
        format!("{:08x}", crc32fast::hash(data))
    }
}

/// Content checksum captured for a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: String,
    pub digest: String,
    pub block_size: u32,
    pub blocks: Vec<u32>,
}

/// Outcome of verifying a record against a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    /// 0 when intact, up to 100 when every block differs.
    pub corruption_level: u8,
}

/// What to do with a record whose payload failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Count the failure against the retry budget and requeue.
    Retry,
    /// Fail the record immediately.
    Discard,
}

/// Decision handed back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityDecision {
    Proceed,
    Retry,
    Discard,
}

/// Computes and validates payload checksums.
#[derive(Clone)]
pub struct IntegrityChecker {
    digest: Arc<dyn PayloadDigest>,
    block_size: usize,
}

impl IntegrityChecker {
    pub fn new(digest: Arc<dyn PayloadDigest>, block_size: usize) -> Self {
        Self {
            digest,
            block_size: block_size.max(1),
        }
    }

    pub fn algorithm(&self) -> &str {
        self.digest.name()
    }

    /// Checksum a JSON payload in its serialized form.
    pub fn checksum(&self, payload: &Value) -> Result<Checksum> {
        Ok(self.checksum_bytes(&payload_bytes(payload)?))
    }

    pub fn checksum_bytes(&self, data: &[u8]) -> Checksum {
        Checksum {
            algorithm: self.digest.name().to_string(),
            digest: self.digest.digest(data),
            block_size: self.block_size as u32,
            blocks: block_digests(data, self.block_size),
        }
    }

    /// Verify a record's current payload against `expected`.
    ///
    /// Never mutates the record; the caller decides what a failure means.
    pub fn verify(&self, record: &OfflineRecord, expected: &Checksum) -> Result<IntegrityReport> {
        if expected.algorithm != self.digest.name() {
            return Err(Error::InvalidInput(format!(
                "Checksum algorithm {} does not match checker {}",
                expected.algorithm,
                self.digest.name()
            )));
        }

        let data = payload_bytes(&record.payload)?;
        if self.digest.digest(&data) == expected.digest {
            return Ok(IntegrityReport {
                valid: true,
                corruption_level: 0,
            });
        }

        let actual = block_digests(&data, expected.block_size.max(1) as usize);
        let total = actual.len().max(expected.blocks.len()).max(1);
        let mismatched = (0..total)
            .filter(|i| actual.get(*i) != expected.blocks.get(*i))
            .count();
        // A differing digest is at least minor corruption even if every block
        // CRC happens to collide.
        let level = ((mismatched * 100 + total - 1) / total).clamp(1, 100);

        Ok(IntegrityReport {
            valid: false,
            corruption_level: level as u8,
        })
    }

    /// Map a report onto the configured repair strategy.
    pub fn decide(&self, report: &IntegrityReport, strategy: RepairStrategy) -> IntegrityDecision {
        if report.valid {
            return IntegrityDecision::Proceed;
        }
        match strategy {
            RepairStrategy::Retry => IntegrityDecision::Retry,
            RepairStrategy::Discard => IntegrityDecision::Discard,
        }
    }
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new(Arc::new(Blake2bDigest), DEFAULT_BLOCK_SIZE)
    }
}

impl std::fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("algorithm", &self.digest.name())
            .field("block_size", &self.block_size)
            .finish()
    }
}

fn block_digests(data: &[u8], block_size: usize) -> Vec<u32> {
    data.chunks(block_size).map(crc32fast::hash).collect()
}
