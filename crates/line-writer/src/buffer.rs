// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

/// Ordered group of records delivered together.
///
/// The line order is fixed at extraction and kept across retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: u64,
    pub lines: Vec<String>,
}

impl Batch {
    /// Newline-joined body sent to the write endpoint.
    pub fn payload(&self) -> String {
        self.lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Removes up to `count` lines from the front, returning how many were removed.
    pub fn drop_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.lines.len());
        self.lines.drain(..count);
        count
    }
}

/// FIFO accumulator of serialized records awaiting extraction.
pub struct RecordBuffer {
    records: VecDeque<String>,
    batch_size: usize,
    max_lines: usize,
    bytes: usize,
    dropped: u64,
    next_batch_id: u64,
}

impl RecordBuffer {
    pub fn new(batch_size: usize, max_lines: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(batch_size.min(4096)),
            batch_size: batch_size.max(1),
            max_lines,
            bytes: 0,
            dropped: 0,
            next_batch_id: 1,
        }
    }

    /// Appends a record. `outstanding` is the number of lines held outside the buffer
    /// (in flight or waiting for a retry) that count against the same ceiling.
    ///
    /// Returns the number of queued records evicted, oldest first, to stay under the
    /// ceiling. The appended record itself is evicted when nothing older is left.
    pub fn append(&mut self, record: String, outstanding: usize) -> usize {
        self.bytes += record.len();
        self.records.push_back(record);

        let mut evicted = 0;
        while self.records.len() + outstanding > self.max_lines {
            match self.records.pop_front() {
                Some(old) => {
                    self.bytes -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        self.dropped += evicted as u64;
        evicted
    }

    /// Takes the next batch if `batch_size` records are queued, or if `force` is set and
    /// anything is queued at all.
    pub fn extract_ready(&mut self, force: bool) -> Option<Batch> {
        if self.records.is_empty() || (!force && self.records.len() < self.batch_size) {
            return None;
        }
        let take = self.records.len().min(self.batch_size);
        let lines: Vec<String> = self.records.drain(..take).collect();
        self.bytes -= lines.iter().map(String::len).sum::<usize>();

        let id = self.next_batch_id;
        self.next_batch_id += 1;
        Some(Batch { id, lines })
    }

    /// Extracts everything queued as a sequence of full batches plus a final partial one.
    pub fn extract_all(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = self.extract_ready(true) {
            batches.push(batch);
        }
        batches
    }

    /// Discards all queued records, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        self.bytes = 0;
        count
    }

    /// Counts lines dropped elsewhere (for example from a batch awaiting retry) towards the
    /// buffer's drop total.
    pub fn record_dropped(&mut self, count: usize) {
        self.dropped += count as u64;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
