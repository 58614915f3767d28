use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_OUTPUT_LINES: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub seq: u64,
    pub at_ms: u64,
    pub text: String,
}

/// Last N lines of worker output, for diagnostics after the fact.
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    seq: AtomicU64,
    dropped_total: AtomicU64,
    lines: RwLock<VecDeque<OutputLine>>,
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            seq: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn push(&self, text: impl Into<String>) -> u64 {
        let mut guard = self.lines.write();
        // Assign under the lock so sequence order matches buffer order.
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        guard.push_back(OutputLine {
            seq,
            at_ms: now_ms(),
            text: text.into(),
        });
        while guard.len() > self.max_lines {
            guard.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        seq
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<OutputLine> {
        let guard = self.lines.read();
        let start = guard.len().saturating_sub(last_n);
        guard.iter().skip(start).cloned().collect()
    }

    pub fn since(&self, seq: u64) -> Vec<OutputLine> {
        self.lines
            .read()
            .iter()
            .filter(|l| l.seq > seq)
            .cloned()
            .collect()
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LINES)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_and_counts() {
        let ring = LogRingBuffer::new(3);
        for i in 1..=5 {
            ring.push(format!("line {i}"));
        }
        let texts: Vec<_> = ring.snapshot(10).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["line 3", "line 4", "line 5"]);
        assert_eq!(ring.dropped_total(), 2);
        assert_eq!(ring.last_seq(), 5);
    }

    #[test]
    fn since_returns_only_newer_lines() {
        let ring = LogRingBuffer::new(10);
        ring.push("a");
        let mark = ring.push("b");
        ring.push("c");
        let newer = ring.since(mark);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].text, "c");
        assert_eq!(ring.snapshot(1)[0].seq, 3);
    }
}
