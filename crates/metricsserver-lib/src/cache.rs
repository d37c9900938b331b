//! Bounded per-application time-series cache
//!
//! Samples are kept ordered by event timestamp. Once the cache holds
//! `capacity` samples, every insertion drops the sample with the smallest
//! timestamp, so the retained window always covers the most recent history.

use crate::models::AppInstanceMetric;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

/// A timestamped, labelled data point that can be cached
pub trait TimeSeries: Clone + Send + Sync {
    /// Event timestamp used for ordering and range queries
    fn timestamp(&self) -> i64;

    /// Whether this data point carries every label in `labels`
    fn has_labels(&self, labels: &HashMap<String, String>) -> bool;
}

impl TimeSeries for AppInstanceMetric {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn has_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.matches_labels(labels)
    }
}

struct Inner<T> {
    data: VecDeque<T>,
    evicted: bool,
}

/// Fixed-capacity cache safe for one writer and many concurrent readers
pub struct TimeSeriesCache<T: TimeSeries> {
    inner: RwLock<Inner<T>>,
    capacity: usize,
}

/// Result of a cache range query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    /// Matching samples in ascending timestamp order
    pub samples: Vec<T>,
    /// False when evicted data may have fallen inside the requested range
    pub fully_covered: bool,
}

impl<T: TimeSeries> TimeSeriesCache<T> {
    /// Create a cache holding at most `capacity` samples.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                data: VecDeque::with_capacity(capacity.min(10_000)),
                evicted: false,
            }),
            capacity,
        }
    }

    /// Insert a sample at its timestamp position, evicting the oldest sample
    /// when the cache is full.
    pub fn put(&self, sample: T) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        // Equal timestamps keep arrival order
        let ts = sample.timestamp();
        let pos = inner.data.partition_point(|d| d.timestamp() <= ts);
        inner.data.insert(pos, sample);

        while inner.data.len() > self.capacity {
            inner.data.pop_front();
            inner.evicted = true;
        }
    }

    /// Samples with `start <= timestamp < end` carrying all `labels`.
    pub fn query(&self, start: i64, end: i64, labels: &HashMap<String, String>) -> QueryResult<T> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let fully_covered = match inner.data.front() {
            Some(oldest) if inner.evicted => oldest.timestamp() < start,
            _ => true,
        };

        let from = inner.data.partition_point(|d| d.timestamp() < start);
        let samples = inner
            .data
            .iter()
            .skip(from)
            .take_while(|d| d.timestamp() < end)
            .filter(|d| d.has_labels(labels))
            .cloned()
            .collect();

        QueryResult {
            samples,
            fully_covered,
        }
    }

    /// Number of samples currently retained
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .data
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct TestTsd {
        timestamp: i64,
        labels: HashMap<String, String>,
    }

    impl TimeSeries for TestTsd {
        fn timestamp(&self) -> i64 {
            self.timestamp
        }

        fn has_labels(&self, labels: &HashMap<String, String>) -> bool {
            labels
                .iter()
                .all(|(k, v)| self.labels.get(k).map(|l| l == v).unwrap_or(false))
        }
    }

    fn tsd(timestamp: i64) -> TestTsd {
        TestTsd {
            timestamp,
            labels: HashMap::new(),
        }
    }

    fn labelled(timestamp: i64, labels: &[(&str, &str)]) -> TestTsd {
        TestTsd {
            timestamp,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn timestamps(cache: &TimeSeriesCache<TestTsd>) -> Vec<i64> {
        cache
            .query(i64::MIN, i64::MAX, &HashMap::new())
            .samples
            .iter()
            .map(|d| d.timestamp)
            .collect()
    }

    #[test]
    fn test_capacity_one_keeps_latest() {
        let cache = TimeSeriesCache::new(1);
        cache.put(tsd(10));
        assert_eq!(timestamps(&cache), vec![10]);
        cache.put(tsd(20));
        assert_eq!(timestamps(&cache), vec![20]);
        cache.put(tsd(15));
        assert_eq!(timestamps(&cache), vec![20]);
        cache.put(tsd(30));
        assert_eq!(timestamps(&cache), vec![30]);
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let cache: TimeSeriesCache<TestTsd> = TimeSeriesCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_within_capacity_sorts_by_timestamp() {
        let cache = TimeSeriesCache::new(5);
        for ts in [20, 10, 40, 50, 30] {
            cache.put(tsd(ts));
        }
        assert_eq!(timestamps(&cache), vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_put_beyond_capacity_evicts_oldest() {
        let cache = TimeSeriesCache::new(3);
        cache.put(tsd(20));
        cache.put(tsd(10));
        cache.put(tsd(40));
        assert_eq!(timestamps(&cache), vec![10, 20, 40]);
        cache.put(tsd(50));
        assert_eq!(timestamps(&cache), vec![20, 40, 50]);
        cache.put(tsd(30));
        assert_eq!(timestamps(&cache), vec![30, 40, 50]);
        cache.put(tsd(50));
        assert_eq!(timestamps(&cache), vec![40, 50, 50]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_query_empty_cache_is_covered() {
        let cache: TimeSeriesCache<TestTsd> = TimeSeriesCache::new(3);
        let result = cache.query(0, i64::MAX, &HashMap::new());
        assert!(result.fully_covered);
        assert!(result.samples.is_empty());
    }

    #[test]
    fn test_query_half_open_range() {
        let cache = TimeSeriesCache::new(5);
        let none = HashMap::new();

        cache.put(tsd(20));
        let result = cache.query(10, 40, &none);
        assert!(result.fully_covered);
        assert_eq!(result.samples, vec![tsd(20)]);

        cache.put(tsd(10));
        cache.put(tsd(40));
        let result = cache.query(10, 40, &none);
        assert_eq!(result.samples, vec![tsd(10), tsd(20)]);

        cache.put(tsd(30));
        cache.put(tsd(50));
        let result = cache.query(10, 40, &none);
        assert!(result.fully_covered);
        assert_eq!(result.samples, vec![tsd(10), tsd(20), tsd(30)]);
    }

    #[test]
    fn test_query_after_eviction_within_window() {
        let cache = TimeSeriesCache::new(3);
        let none = HashMap::new();
        for ts in [20, 10, 40, 30] {
            cache.put(tsd(ts));
        }

        let result = cache.query(30, 50, &none);
        assert!(result.fully_covered);
        assert_eq!(result.samples, vec![tsd(30), tsd(40)]);

        cache.put(tsd(50));
        let result = cache.query(35, 50, &none);
        assert!(result.fully_covered);
        assert_eq!(result.samples, vec![tsd(40)]);
    }

    #[test]
    fn test_query_reaching_into_evicted_history() {
        let cache = TimeSeriesCache::new(3);
        let none = HashMap::new();
        for ts in [20, 10, 40, 30] {
            cache.put(tsd(ts));
        }
        assert!(!cache.query(10, 50, &none).fully_covered);

        cache.put(tsd(50));
        // A sample stamped 30 may have been evicted alongside the retained one
        assert!(!cache.query(30, 50, &none).fully_covered);
    }

    #[test]
    fn test_evicted_sample_never_returned() {
        let cache = TimeSeriesCache::new(2);
        cache.put(tsd(1));
        cache.put(tsd(2));
        cache.put(tsd(3));
        let result = cache.query(0, 10, &HashMap::new());
        assert_eq!(result.samples, vec![tsd(2), tsd(3)]);
    }

    #[test]
    fn test_query_with_labels() {
        let cache = TimeSeriesCache::new(5);
        cache.put(labelled(20, &[("tom", "cat"), ("pig", "pepper")]));
        cache.put(tsd(10));
        cache.put(labelled(40, &[("jerry", "mouse"), ("tom", "cat"), ("peppa", "pig")]));
        cache.put(labelled(30, &[("jerry", "mouse")]));
        cache.put(tsd(50));

        let labels: HashMap<String, String> = [("jerry", "mouse"), ("tom", "cat")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let result = cache.query(20, 60, &labels);
        assert!(result.fully_covered);
        assert_eq!(
            result.samples,
            vec![labelled(40, &[("jerry", "mouse"), ("tom", "cat"), ("peppa", "pig")])]
        );
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        use std::sync::Arc;

        let cache = Arc::new(TimeSeriesCache::new(100));
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for ts in 0..1000 {
                    cache.put(tsd(ts));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let result = cache.query(0, i64::MAX, &HashMap::new());
                        assert!(result.samples.len() <= 100);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(timestamps(&cache), (900..1000).collect::<Vec<_>>());
    }
}
