//! Feature extraction.
//!
//! A [`FeatureVector`] is a fixed-length, versioned summary of a decoded
//! payload. Extraction is streaming: [`FeatureAccumulator`] consumes chunks of
//! any size and produces bit-identical output to a single pass, which is what
//! makes caching by dataset fingerprint sound.

use crate::dataset::Dataset;
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const FEATURE_VERSION: u8 = 1;
pub const FEATURE_COUNT: usize = 28;

/// Bytes per entropy block.
pub const BLOCK_SIZE: usize = 256;
pub const HISTOGRAM_BUCKETS: usize = 16;

const LAGS: [usize; 3] = [1, 8, 16];
const HISTORY: usize = 16;
const MAX_TRACKED_BLOCKS: usize = 1 << 16;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "block_entropy_mean",
    "block_entropy_std",
    "block_entropy_min",
    "overall_entropy",
    "repeat_rate_16",
    "repeat_rate_8",
    "lag_match_1",
    "lag_match_8",
    "lag_match_16",
    "length_log2",
    "aligned_16",
    "aligned_8",
    "hist_0",
    "hist_1",
    "hist_2",
    "hist_3",
    "hist_4",
    "hist_5",
    "hist_6",
    "hist_7",
    "hist_8",
    "hist_9",
    "hist_10",
    "hist_11",
    "hist_12",
    "hist_13",
    "hist_14",
    "hist_15",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub version: u8,
    pub values: Vec<f64>,
}

impl FeatureVector {
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES.iter().position(|n| *n == name).and_then(|i| self.values.get(i).copied())
    }

    /// Trace summary of a finished vector.
    #[must_use]
    pub fn sample(&self, processed_bytes: u64) -> FeatureSample {
        FeatureSample {
            processed_bytes,
            entropy: self.values.get(3).copied().unwrap_or(0.0),
            block_repetition: self.values.get(4).copied().unwrap_or(0.0),
        }
    }

    /// Layout check for vectors loaded from storage.
    #[must_use]
    pub fn is_current_layout(&self) -> bool {
        self.version == FEATURE_VERSION && self.values.len() == FEATURE_COUNT
    }
}

/// Running summary exposed while extraction is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSample {
    pub processed_bytes: u64,
    /// Overall entropy so far, in bits per byte divided by 8.
    pub entropy: f64,
    /// Repeated 16-byte block rate so far.
    pub block_repetition: f64,
}

/// Progress report handed to the checkpoint closure after every chunk.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionProgress {
    pub processed: u64,
    pub total: u64,
    pub sample: FeatureSample,
}

impl ExtractionProgress {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

#[derive(Debug)]
struct RepetitionTracker {
    width: usize,
    pending: Vec<u8>,
    seen: HashSet<u128>,
    blocks: u64,
    repeats: u64,
}

impl RepetitionTracker {
    fn new(width: usize) -> Self {
        Self { width, pending: Vec::with_capacity(width), seen: HashSet::new(), blocks: 0, repeats: 0 }
    }

    fn push(&mut self, byte: u8) {
        self.pending.push(byte);
        if self.pending.len() < self.width {
            return;
        }

        let mut key = [0u8; 16];
        key[..self.width].copy_from_slice(&self.pending);
        let key = u128::from_le_bytes(key);
        self.pending.clear();

        self.blocks += 1;
        if self.seen.contains(&key) {
            self.repeats += 1;
        } else if self.seen.len() < MAX_TRACKED_BLOCKS {
            self.seen.insert(key);
        }
    }

    fn rate(&self) -> f64 {
        if self.blocks == 0 {
            return 0.0;
        }
        self.repeats as f64 / self.blocks as f64
    }
}

#[derive(Debug)]
pub struct FeatureAccumulator {
    total: u64,
    byte_counts: [u64; 256],
    block: Vec<u8>,
    blocks: u64,
    entropy_sum: f64,
    entropy_sq_sum: f64,
    entropy_min: f64,
    history: [u8; HISTORY],
    lag_matches: [u64; LAGS.len()],
    lag_pairs: [u64; LAGS.len()],
    repeat16: RepetitionTracker,
    repeat8: RepetitionTracker,
}

impl Default for FeatureAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: 0,
            byte_counts: [0; 256],
            block: Vec::with_capacity(BLOCK_SIZE),
            blocks: 0,
            entropy_sum: 0.0,
            entropy_sq_sum: 0.0,
            entropy_min: f64::INFINITY,
            history: [0; HISTORY],
            lag_matches: [0; LAGS.len()],
            lag_pairs: [0; LAGS.len()],
            repeat16: RepetitionTracker::new(16),
            repeat8: RepetitionTracker::new(8),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            self.push(byte);
        }
    }

    fn push(&mut self, byte: u8) {
        let pos = self.total as usize;
        for (i, &lag) in LAGS.iter().enumerate() {
            if pos >= lag {
                self.lag_pairs[i] += 1;
                if self.history[(pos - lag) % HISTORY] == byte {
                    self.lag_matches[i] += 1;
                }
            }
        }
        self.history[pos % HISTORY] = byte;

        self.byte_counts[usize::from(byte)] += 1;
        self.repeat16.push(byte);
        self.repeat8.push(byte);

        self.block.push(byte);
        if self.block.len() == BLOCK_SIZE {
            let h = block_entropy(&self.block);
            self.record_block(h);
            self.block.clear();
        }

        self.total += 1;
    }

    fn record_block(&mut self, entropy: f64) {
        self.blocks += 1;
        self.entropy_sum += entropy;
        self.entropy_sq_sum += entropy * entropy;
        self.entropy_min = self.entropy_min.min(entropy);
    }

    #[must_use]
    pub fn processed(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn sample(&self) -> FeatureSample {
        FeatureSample {
            processed_bytes: self.total,
            entropy: counts_entropy(&self.byte_counts, self.total) / 8.0,
            block_repetition: self.repeat16.rate(),
        }
    }

    #[must_use]
    pub fn finish(mut self) -> FeatureVector {
        let mut values = vec![0.0; FEATURE_COUNT];
        if self.total == 0 {
            return FeatureVector { version: FEATURE_VERSION, values };
        }

        // A trailing partial block only counts when it is all we have.
        if self.blocks == 0 && !self.block.is_empty() {
            let h = block_entropy(&self.block);
            self.record_block(h);
        }

        let n = self.blocks as f64;
        let mean = self.entropy_sum / n;
        let variance = (self.entropy_sq_sum / n - mean * mean).max(0.0);

        values[0] = mean / 8.0;
        values[1] = variance.sqrt() / 8.0;
        values[2] = self.entropy_min / 8.0;
        values[3] = counts_entropy(&self.byte_counts, self.total) / 8.0;
        values[4] = self.repeat16.rate();
        values[5] = self.repeat8.rate();
        for (i, (&matches, &pairs)) in self.lag_matches.iter().zip(&self.lag_pairs).enumerate() {
            values[6 + i] = if pairs == 0 { 0.0 } else { matches as f64 / pairs as f64 };
        }
        values[9] = ((self.total as f64 + 1.0).log2() / 32.0).min(1.0);
        values[10] = if self.total % 16 == 0 { 1.0 } else { 0.0 };
        values[11] = if self.total % 8 == 0 { 1.0 } else { 0.0 };

        let per_bucket = 256 / HISTOGRAM_BUCKETS;
        for (bucket, counts) in self.byte_counts.chunks(per_bucket).enumerate() {
            let sum: u64 = counts.iter().sum();
            values[12 + bucket] = sum as f64 / self.total as f64;
        }

        FeatureVector { version: FEATURE_VERSION, values }
    }
}

fn block_entropy(block: &[u8]) -> f64 {
    let mut counts = [0u64; 256];
    for &b in block {
        counts[usize::from(b)] += 1;
    }
    counts_entropy(&counts, block.len() as u64)
}

fn counts_entropy(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let mut h = 0.0;
    for &c in counts {
        if c > 0 {
            let p = c as f64 / total;
            h -= p * p.log2();
        }
    }
    h
}

/// One-shot extraction over a decoded payload.
#[must_use]
pub fn extract_payload(payload: &[u8]) -> FeatureVector {
    let mut acc = FeatureAccumulator::new();
    acc.update(payload);
    acc.finish()
}

/// Deterministic, pure extraction for a validated dataset.
#[must_use]
pub fn extract(dataset: &Dataset) -> FeatureVector {
    extract_payload(&dataset.payload())
}

/// Chunked extraction that yields to the runtime between chunks.
///
/// `checkpoint` runs after every chunk; returning an error (cancellation,
/// deadline) stops extraction at that boundary.
pub async fn extract_incremental<F>(payload: &[u8], chunk_size: usize, mut checkpoint: F) -> TrainingResult<FeatureVector>
where
    F: FnMut(ExtractionProgress) -> TrainingResult<()>,
{
    let mut acc = FeatureAccumulator::new();
    let total = payload.len() as u64;

    if payload.is_empty() {
        checkpoint(ExtractionProgress { processed: 0, total, sample: acc.sample() })?;
        return Ok(acc.finish());
    }

    for chunk in payload.chunks(chunk_size.max(1)) {
        acc.update(chunk);
        checkpoint(ExtractionProgress { processed: acc.processed(), total, sample: acc.sample() })?;
        tokio::task::yield_now().await;
    }

    Ok(acc.finish())
}
