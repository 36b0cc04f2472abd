use std::time::Duration;

use tokio::time::Instant;

use crate::{Batch, Resource, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush once this many samples are buffered.
    pub send_batch_size: usize,
    /// Upper bound on one flushed batch; `0` means unbounded.
    pub send_batch_max_size: usize,
    /// Flush once this long has passed since the previous flush.
    pub timeout: Duration,
}

/// Buffers the samples of one source until a size or time threshold is hit.
#[derive(Debug)]
pub struct Aggregator {
    resource: Resource,
    buf: Vec<Sample>,
    config: BatchConfig,
    last_flush: Instant,
}
impl Aggregator {
    pub fn new(resource: Resource, config: BatchConfig) -> Self {
        Self {
            resource,
            buf: vec![],
            config,
            last_flush: Instant::now(),
        }
    }

    pub fn add(&mut self, samples: impl IntoIterator<Item = Sample>) {
        self.buf.extend(samples);
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.config.send_batch_size.max(1)
    }
    pub fn is_due(&self, now: Instant) -> bool {
        self.is_full() || now.duration_since(self.last_flush) >= self.config.timeout
    }

    /// Takes every buffered sample. Returns `None` when nothing is buffered;
    /// the flush timer restarts either way.
    pub fn flush(&mut self) -> Option<Batch> {
        self.last_flush = Instant::now();
        if self.buf.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.buf);
        Some(Batch::new(self.resource.clone(), samples))
    }

    /// [`Self::flush`], split by `send_batch_max_size`.
    pub fn flush_split(&mut self) -> Vec<Batch> {
        match self.flush() {
            Some(batch) => batch.split(self.config.send_batch_max_size),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn config(size: usize) -> BatchConfig {
        BatchConfig {
            send_batch_size: size,
            send_batch_max_size: 0,
            timeout: Duration::from_secs(5),
        }
    }

    fn samples(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new("m", i as u64, i as f64)).collect()
    }

    #[test]
    fn empty_flush_is_noop() {
        let mut agg = Aggregator::new(Resource::new(), config(3));
        assert!(agg.flush().is_none());
        assert!(agg.flush_split().is_empty());
    }

    #[test]
    fn full_at_threshold() {
        let mut agg = Aggregator::new(Resource::new(), config(3));
        agg.add(samples(2));
        assert!(!agg.is_full());
        agg.add(samples(2));
        assert!(agg.is_full());
        let batch = agg.flush().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(agg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn due_after_timeout() {
        let mut agg = Aggregator::new(Resource::new(), config(100));
        agg.add(samples(1));
        assert!(!agg.is_due(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(agg.is_due(Instant::now()));
        agg.flush();
        assert!(!agg.is_due(Instant::now()));
    }

    #[test]
    fn flush_split_respects_max_size() {
        let mut agg = Aggregator::new(
            Resource::new(),
            BatchConfig {
                send_batch_max_size: 4,
                ..config(1)
            },
        );
        agg.add(samples(10));
        let sizes: Vec<usize> = agg.flush_split().iter().map(Batch::len).collect();
        assert_eq!(sizes, [4, 4, 2]);
    }

    proptest! {
        #[test]
        fn flushes_conserve_samples(
            scrapes in prop::collection::vec(0usize..20, 0..30),
            threshold in 1usize..25,
        ) {
            let mut agg = Aggregator::new(Resource::new(), config(threshold));
            let mut flushed = vec![];
            let mut added_since_flush = 0;
            let mut next_time = 0u64;
            for n in scrapes {
                let scrape: Vec<Sample> = (0..n)
                    .map(|_| {
                        next_time += 1;
                        Sample::new("m", next_time, 0.0)
                    })
                    .collect();
                agg.add(scrape);
                added_since_flush += n;
                if agg.is_full() {
                    let batch = agg.flush().unwrap();
                    prop_assert_eq!(batch.len(), added_since_flush);
                    added_since_flush = 0;
                    flushed.extend(batch.into_samples());
                }
            }
            if let Some(batch) = agg.flush() {
                prop_assert_eq!(batch.len(), added_since_flush);
                flushed.extend(batch.into_samples());
            }
            let times: Vec<u64> = flushed.iter().map(|s| s.time).collect();
            let expected: Vec<u64> = (1..=next_time).collect();
            prop_assert_eq!(times, expected);
        }
    }
}
