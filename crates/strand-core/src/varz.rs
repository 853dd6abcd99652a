//! Process-wide stats counters ("varz").
//!
//! Counters register themselves on construction in a global list;
//! [`snapshot`] iterates it under a lock. The HTTP presentation layer is
//! a consumer of `snapshot`, not part of this crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

trait VarzNode: Send + Sync {
    fn name(&self) -> &str;
    fn value(&self) -> i64;
}

fn registry() -> &'static Mutex<Vec<Weak<dyn VarzNode>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<dyn VarzNode>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn register(node: Weak<dyn VarzNode>) {
    registry().lock().expect("varz registry poisoned").push(node);
}

/// Collect `(name, value)` for every live counter, pruning dropped ones.
pub fn snapshot() -> Vec<(String, i64)> {
    let mut reg = registry().lock().expect("varz registry poisoned");
    reg.retain(|w| w.strong_count() > 0);
    reg.iter()
        .filter_map(|w| w.upgrade())
        .map(|n| (n.name().to_string(), n.value()))
        .collect()
}

/// A plain monotonically adjusted counter, read with relaxed ordering.
#[derive(Clone)]
pub struct VarzCount {
    inner: Arc<CountInner>,
}

struct CountInner {
    name: String,
    val: AtomicI64,
}

impl VarzNode for CountInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> i64 {
        self.val.load(Ordering::Relaxed)
    }
}

impl VarzCount {
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(CountInner { name: name.to_string(), val: AtomicI64::new(0) });
        let dyn_inner: Arc<dyn VarzNode> = inner.clone();
        let node: Weak<dyn VarzNode> = Arc::downgrade(&dyn_inner);
        register(node);
        VarzCount { inner }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: i64) {
        self.inner.val.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.inner.val.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.inner.val.load(Ordering::Relaxed)
    }
}

const QPS_WINDOW: usize = 7;

/// Queries-per-second gauge over a 7-second sliding window. The value
/// reported is the average of the 6 fully filled seconds; the lifetime
/// total is kept for the shutdown summary.
#[derive(Clone)]
pub struct VarzQps {
    inner: Arc<QpsInner>,
}

struct QpsInner {
    name: String,
    buckets: [AtomicU64; QPS_WINDOW],
    last_sec: AtomicU64,
    total: AtomicU64,
}

impl VarzNode for QpsInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> i64 {
        self.qps() as i64
    }
}

impl QpsInner {
    fn advance(&self, now: u64) {
        let last = self.last_sec.swap(now, Ordering::Relaxed);
        if now > last {
            // Clear the buckets the window skipped over. Racy against
            // concurrent incs, which is acceptable for a gauge.
            let span = (now - last).min(QPS_WINDOW as u64);
            for s in 1..=span {
                let idx = ((last + s) % QPS_WINDOW as u64) as usize;
                self.buckets[idx].store(0, Ordering::Relaxed);
            }
        }
    }

    fn qps(&self) -> u64 {
        let now = now_sec();
        self.advance(now);
        let cur = (now % QPS_WINDOW as u64) as usize;
        let sum: u64 = (0..QPS_WINDOW)
            .filter(|i| *i != cur)
            .map(|i| self.buckets[i].load(Ordering::Relaxed))
            .sum();
        sum / (QPS_WINDOW as u64 - 1)
    }
}

fn now_sec() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl VarzQps {
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(QpsInner {
            name: name.to_string(),
            buckets: Default::default(),
            last_sec: AtomicU64::new(now_sec()),
            total: AtomicU64::new(0),
        });
        let dyn_inner: Arc<dyn VarzNode> = inner.clone();
        let node: Weak<dyn VarzNode> = Arc::downgrade(&dyn_inner);
        register(node);
        VarzQps { inner }
    }

    pub fn inc(&self) {
        let now = now_sec();
        self.inner.advance(now);
        self.inner.buckets[(now % QPS_WINDOW as u64) as usize].fetch_add(1, Ordering::Relaxed);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn qps(&self) -> u64 {
        self.inner.qps()
    }

    pub fn lifetime_total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_registers() {
        let c = VarzCount::new("test-count-registers");
        c.inc_by(3);
        let snap = snapshot();
        assert!(snap.iter().any(|(n, v)| n == "test-count-registers" && *v == 3));
    }

    #[test]
    fn test_qps_total() {
        let q = VarzQps::new("test-qps-total");
        for _ in 0..10 {
            q.inc();
        }
        assert_eq!(q.lifetime_total(), 10);
    }

    #[test]
    fn test_snapshot_prunes_dropped() {
        {
            let _c = VarzCount::new("test-snapshot-transient");
        }
        let snap = snapshot();
        assert!(!snap.iter().any(|(n, _)| n == "test-snapshot-transient"));
    }
}
