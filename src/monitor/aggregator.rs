//! Append-only, reader/writer-locked line buffer.

use std::sync::Arc;

use tokio::sync::RwLock;

#[derive(Default)]
struct LogBuffer {
    text: String,
    lines: usize,
}

/// Thread-safe container for all received log lines.
///
/// Cloning shares the same buffer: hand one clone to the ingest task and one
/// to the read endpoint. Writers take the lock exclusively, readers share it.
#[derive(Clone, Default)]
pub struct LogAggregator {
    buffer: Arc<RwLock<LogBuffer>>,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `line` followed by a newline.
    pub async fn append(&self, line: &str) {
        let mut buffer = self.buffer.write().await;
        buffer.text.reserve(line.len() + 1);
        buffer.text.push_str(line);
        buffer.text.push('\n');
        buffer.lines += 1;
    }

    /// Everything received so far, one newline-terminated line per message.
    pub async fn snapshot(&self) -> String {
        self.buffer.read().await.text.clone()
    }

    /// Number of lines appended so far.
    pub async fn line_count(&self) -> usize {
        self.buffer.read().await.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_snapshot() {
        let aggregator = LogAggregator::new();
        assert_eq!(aggregator.snapshot().await, "");
        assert_eq!(aggregator.line_count().await, 0);
    }

    #[tokio::test]
    async fn test_append_terminates_each_line() {
        let aggregator = LogAggregator::new();
        aggregator.append("SND 1").await;
        aggregator.append("").await;
        aggregator.append("SND STOP").await;

        assert_eq!(aggregator.snapshot().await, "SND 1\n\nSND STOP\n");
        assert_eq!(aggregator.line_count().await, 3);
    }

    #[tokio::test]
    async fn test_clones_share_buffer() {
        let writer = LogAggregator::new();
        let reader = writer.clone();

        writer.append("shared").await;

        assert_eq!(reader.snapshot().await, "shared\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshots_during_writes_are_line_aligned_prefixes() {
        const LINES: usize = 2000;
        let aggregator = LogAggregator::new();
        let expected: String = (0..LINES)
            .map(|i| format!("line {:04} {}\n", i, "x".repeat(i % 37)))
            .collect();

        let writer = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                for i in 0..LINES {
                    aggregator
                        .append(&format!("line {:04} {}", i, "x".repeat(i % 37)))
                        .await;
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = aggregator.clone();
                let expected = expected.clone();
                tokio::spawn(async move {
                    let mut last_len = 0;
                    loop {
                        let snapshot = aggregator.snapshot().await;
                        assert!(expected.starts_with(&snapshot), "snapshot is not a prefix");
                        assert!(snapshot.is_empty() || snapshot.ends_with('\n'), "torn line");
                        assert!(snapshot.len() >= last_len, "snapshot went backwards");
                        last_len = snapshot.len();
                        if snapshot.len() == expected.len() {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(aggregator.snapshot().await, expected);
    }
}
