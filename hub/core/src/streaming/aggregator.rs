//! Stream Aggregator Implementation
//!
//! Buffers incremental chunks and decides when to flush them.

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one aggregation run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Chunks pushed in
    pub chunks_received: u32,
    /// Messages emitted (threshold flushes plus the final flush)
    pub messages_emitted: u32,
}

// ============================================================================
// Aggregator
// ============================================================================

/// Chunk buffer with a flush threshold
///
/// With a threshold `T <= 1` every chunk passes straight through. With
/// `T > 1` chunks accumulate and the buffer flushes when the count
/// *exceeds* `T`, i.e. on the `T+1`-th chunk. Whatever remains flushes from
/// [`StreamAggregator::finish`].
#[derive(Debug)]
pub struct StreamAggregator {
    /// Flush threshold
    threshold: usize,
    /// Accumulated text since the last flush
    buffer: String,
    /// Chunks accumulated since the last flush
    pending: usize,
    /// Run statistics
    stats: AggregatorStats,
}

impl StreamAggregator {
    /// Create an aggregator with the given threshold
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buffer: String::new(),
            pending: 0,
            stats: AggregatorStats::default(),
        }
    }

    /// Whether chunks are forwarded one by one
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.threshold <= 1
    }

    /// Run statistics
    #[must_use]
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Feed one chunk, returning a message if one is due
    pub fn push(&mut self, chunk: impl Into<String>) -> Option<String> {
        let chunk = chunk.into();
        self.stats.chunks_received += 1;

        if self.is_passthrough() {
            self.stats.messages_emitted += 1;
            return Some(chunk);
        }

        self.buffer.push_str(&chunk);
        self.pending += 1;

        if self.pending > self.threshold {
            self.pending = 0;
            self.stats.messages_emitted += 1;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Flush the remainder at end of stream
    ///
    /// Returns `None` when nothing is buffered.
    pub fn finish(&mut self) -> Option<String> {
        self.pending = 0;
        if self.buffer.is_empty() {
            return None;
        }
        self.stats.messages_emitted += 1;
        Some(std::mem::take(&mut self.buffer))
    }
}
