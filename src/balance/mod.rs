//! Node table and sharded smooth-weighted-round-robin picker
//!
//! Nodes are distributed across buckets at startup; each bucket carries its
//! own SWRR state behind a mutex, so one pick only contends with picks that
//! landed in the same bucket. The node set is fixed for the process
//! lifetime: a reload with a differing node count keeps the current nodes
//! and logs a warning.

mod node;

pub use node::Node;

use crate::config::Config;
use crate::dispatch::transport::TransportTuning;
use crate::Result;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

struct Bucket {
    nodes: Mutex<Vec<Arc<Node>>>,
}

pub struct Balancer {
    buckets: Vec<Bucket>,
    node_index: FnvHashMap<String, Arc<Node>>,
    config: RwLock<Arc<Config>>,
    total_inflight: AtomicI64,
    node_count: usize,
    rng: Mutex<StdRng>,
}

impl Balancer {
    pub fn new(cfg: Config) -> Result<Self> {
        let shards = cfg.gateway.shards.max(1);
        let tuning = TransportTuning::from(&cfg.gateway);

        let mut balancer = Balancer {
            buckets: (0..shards).map(|_| Bucket { nodes: Mutex::new(Vec::new()) }).collect(),
            node_index: FnvHashMap::default(),
            config: RwLock::new(Arc::new(Config::default())),
            total_inflight: AtomicI64::new(0),
            node_count: cfg.nodes.len(),
            rng: Mutex::new(StdRng::from_entropy()),
        };

        for nc in &cfg.nodes {
            let node = Arc::new(Node::new(nc, &tuning)?);
            let idx = balancer.pick_bucket_index(&nc.address, cfg.strategy.hash_shard);
            balancer.buckets[idx].nodes.lock().push(node.clone());
            balancer.node_index.insert(nc.address.clone(), node);
        }

        *balancer.config.write() = Arc::new(cfg);
        Ok(balancer)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn node_by_address(&self, address: &str) -> Option<Arc<Node>> {
        self.node_index.get(address).cloned()
    }

    pub fn total_inflight(&self) -> i64 {
        self.total_inflight.load(Ordering::Acquire)
    }

    fn pick_bucket_index(&self, key: &str, hash_shard: bool) -> usize {
        if self.buckets.len() == 1 {
            return 0;
        }
        if hash_shard {
            return fnv1a_32(key.as_bytes()) as usize % self.buckets.len();
        }
        self.rng.lock().gen_range(0..self.buckets.len())
    }

    /// Pick a node with one SWRR round.
    ///
    /// The bucket is chosen under the config read lock; the round itself
    /// runs under the bucket mutex only. Neither lock is held across I/O.
    pub fn select(&self, key: &str) -> Option<Arc<Node>> {
        let idx = {
            let cfg = self.config.read();
            let mut idx = self.pick_bucket_index(key, cfg.strategy.hash_shard);
            if self.buckets[idx].nodes.lock().is_empty() {
                // fallback: first non-empty bucket in order
                for (i, bucket) in self.buckets.iter().enumerate() {
                    if !bucket.nodes.lock().is_empty() {
                        idx = i;
                        break;
                    }
                }
            }
            idx
        };

        let nodes = self.buckets[idx].nodes.lock();
        let mut total = 0i32;
        let mut best: Option<(&Arc<Node>, i32)> = None;
        for n in nodes.iter() {
            let ew = n.effective_weight();
            let cw = n.current_weight.load(Ordering::Relaxed) + ew;
            n.current_weight.store(cw, Ordering::Relaxed);
            total += ew;
            if best.map_or(true, |(_, bw)| cw > bw) {
                best = Some((n, cw));
            }
        }
        best.map(|(n, _)| {
            n.current_weight.fetch_sub(total, Ordering::Relaxed);
            n.clone()
        })
    }

    /// Visit every node. The bucket vectors are snapshotted so the callback
    /// runs without any bucket mutex held.
    pub fn for_each_node<F: FnMut(&Arc<Node>)>(&self, mut f: F) {
        for bucket in &self.buckets {
            let nodes = bucket.nodes.lock().clone();
            for n in &nodes {
                f(n);
            }
        }
    }

    /// All nodes in bucket order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut out = Vec::with_capacity(self.node_count);
        self.for_each_node(|n| out.push(n.clone()));
        out
    }

    /// Track an in-flight request starting (+1) or finishing (-1) on `node`,
    /// then re-run the connection-balance correction.
    pub fn adjust_conn(&self, node: &Node, delta: i64) {
        node.adjust_inflight(delta);
        self.total_inflight.fetch_add(delta, Ordering::AcqRel);
        let cfg = self.config();
        self.update_conn_factor(&cfg);
    }

    /// Recompute each node's connection-balance delta.
    ///
    /// When the correction is disabled every residual delta is zeroed and
    /// the affected weights resynced. Otherwise each node's inflight share
    /// is compared against the fair share `1/N`, folded through an EMA, and
    /// projected onto the effective weight. Small movements under the sync
    /// threshold are debounced.
    fn update_conn_factor(&self, cfg: &Config) {
        let st = &cfg.strategy;
        if !st.conn_factor_enabled {
            self.for_each_node(|n| {
                if n.conn_delta() != 0.0 {
                    n.set_conn_delta(0.0);
                    n.sync_weight(st.min_weight);
                }
            });
            return;
        }
        if self.node_count == 0 {
            return;
        }
        let n_count = self.node_count as f64;
        let total = self.total_inflight.load(Ordering::Acquire) as f64;
        let smoothing = st.conn_factor_smoothing as f64;
        let alpha = st.conn_factor_ema_alpha;
        let threshold = st.conn_factor_sync_threshold;
        let slope = st.conn_factor_slope;
        let denom = total + smoothing;

        self.for_each_node(|node| {
            let delta = if denom <= 0.0 {
                0.0
            } else {
                let share = (node.inflight() as f64 + smoothing / n_count) / denom;
                let target_share = 1.0 / n_count;
                (10.0 * (target_share - share) / slope).clamp(-10.0, 10.0)
            };
            let last = node.conn_delta();
            if (delta - last).abs() <= threshold {
                return;
            }
            let next = last * (1.0 - alpha) + delta * alpha;
            node.set_conn_delta(next);
            node.sync_weight(st.min_weight);
        });
    }

    /// Publish a new configuration snapshot.
    ///
    /// The node list is fixed at startup: a differing node count in the new
    /// configuration is ignored with a warning and the current nodes are
    /// kept. Gateway and strategy records are swapped atomically under the
    /// write lock, and the connection-balance correction is re-evaluated
    /// against the new strategy.
    pub fn apply_config(&self, next: Config) -> Result<()> {
        let mut current = self.config.write();
        if next.nodes.len() != current.nodes.len() {
            warn!(
                current = current.nodes.len(),
                next = next.nodes.len(),
                "reload: node list change ignored"
            );
        }
        let mut merged = (**current).clone();
        merged.gateway = next.gateway;
        merged.strategy = next.strategy;
        let merged = Arc::new(merged);
        *current = merged.clone();
        self.update_conn_factor(&merged);
        Ok(())
    }

    /// Periodic effective-weight recovery sweep.
    ///
    /// Every `recovery_interval` each node's effective weight is nudged up
    /// by one, clamped to `[min_weight, initial_weight]`. This is also the
    /// path that re-applies a raised `min_weight` after a reload.
    pub async fn run_recovery(self: Arc<Self>) {
        loop {
            let interval = self.config.read().strategy.recovery_interval;
            tokio::time::sleep(interval).await;
            let min_weight = self.config.read().strategy.min_weight;
            self.for_each_node(|n| n.update_effective_weight(1, min_weight));
        }
    }
}

/// 32-bit FNV-1a used for shard selection.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
