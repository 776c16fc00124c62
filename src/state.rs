use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::hashing;

/// The key a resume record is matched against on a later attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    /// Stable name of the byte source (page URL plus format id).
    pub source: String,
    pub destination: PathBuf,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
}

impl JobIdentity {
    /// File stem of the record; independent of length and etag so that a
    /// changed source finds, and replaces, its stale record.
    pub fn record_key(&self) -> String {
        hashing::record_key(&self.source, &self.destination)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResumeRecord {
    pub identity: JobIdentity,
    pub segment_count: usize,
    pub segment_size: u64,
    pub done: BTreeSet<usize>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn completed_bytes(&self) -> u64 {
        let Some(total) = self.identity.content_length else {
            return 0;
        };
        self.done
            .iter()
            .map(|&i| {
                let start = i as u64 * self.segment_size;
                let end = (start + self.segment_size).min(total);
                end.saturating_sub(start)
            })
            .sum()
    }

    pub fn bitmap(&self) -> CompletionBitmap {
        CompletionBitmap::from_indices(self.segment_count, self.done.iter().copied())
    }
}

/// Which segments of a plan are already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionBitmap {
    bits: Vec<bool>,
}

impl CompletionBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmap = Self::new(len);
        for i in indices {
            if let Some(bit) = bitmap.bits.get_mut(i) {
                *bit = true;
            }
        }
        bitmap
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn done_count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn done_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, done)| done.then_some(i))
    }
}
