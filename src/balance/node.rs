//! Upstream node state and the scoring pipeline
//!
//! A node carries two orthogonal health scores: the passive score follows
//! observed request outcomes, the active score follows periodic probes. An
//! optional connection-balance correction (`conn_delta`) nudges the result.
//! All three are projected onto `effective_weight`, the value the SWRR
//! picker consumes. Every mutable field is an atomic; `current_weight` is
//! only touched while the owning bucket's mutex is held.

use crate::config::NodeConfig;
use crate::dispatch::transport;
use crate::script::NodeMeta;
use crate::Result;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

pub struct Node {
    pub id: String,
    pub address: String,
    pub target: Url,
    pub initial_weight: i32,
    pub check_script: String,

    /// Upstream round-tripper with its own idle-connection pool
    pub(crate) client: reqwest::Client,

    effective_weight: AtomicI32,
    /// SWRR running counter; guarded by the owning bucket mutex
    pub(crate) current_weight: AtomicI32,
    passive_score: AtomicI32,
    active_score: AtomicI32,
    /// f64 bit pattern, value in [-10, +10]
    conn_delta: AtomicU64,
    inflight: AtomicI64,
    /// Packed `(unix_seconds << 32) | penalty_used_this_second`
    penalty_window: AtomicU64,
}

impl Node {
    pub fn new(nc: &NodeConfig, tuning: &transport::TransportTuning) -> Result<Self> {
        let target = Url::parse(&nc.address)?;
        let client = transport::build_client(tuning)?;
        Ok(Node {
            id: nc.id.clone(),
            address: nc.address.clone(),
            target,
            initial_weight: nc.weight,
            check_script: nc.check_script.clone(),
            client,
            effective_weight: AtomicI32::new(nc.weight),
            current_weight: AtomicI32::new(0),
            passive_score: AtomicI32::new(100),
            active_score: AtomicI32::new(100),
            conn_delta: AtomicU64::new(0f64.to_bits()),
            inflight: AtomicI64::new(0),
            penalty_window: AtomicU64::new(0),
        })
    }

    pub fn effective_weight(&self) -> i32 {
        self.effective_weight.load(Ordering::Acquire)
    }

    pub fn passive_score(&self) -> i32 {
        self.passive_score.load(Ordering::Acquire)
    }

    pub fn active_score(&self) -> i32 {
        self.active_score.load(Ordering::Acquire)
    }

    pub fn conn_delta(&self) -> f64 {
        f64::from_bits(self.conn_delta.load(Ordering::Acquire))
    }

    pub(crate) fn set_conn_delta(&self, value: f64) {
        self.conn_delta.store(value.to_bits(), Ordering::Release);
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn adjust_inflight(&self, delta: i64) {
        self.inflight.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set_passive_score(&self, score: i32) {
        self.passive_score.store(score.clamp(0, 100), Ordering::Release);
    }

    pub fn set_active_score(&self, score: i32) {
        self.active_score.store(score.clamp(0, 100), Ordering::Release);
    }

    /// Apply a passive-score delta.
    ///
    /// Positive deltas apply unconditionally, saturating at 100. Negative
    /// deltas pass a per-second token bucket: within one wall-clock second
    /// at most `max_penalty_per_second` points of penalty are applied, the
    /// surplus is dropped. A non-positive cap disables the limit.
    pub fn update_passive_score(&self, delta: i32, max_penalty_per_second: i32) {
        let delta = if delta < 0 && max_penalty_per_second > 0 {
            -self.reserve_penalty(-delta, max_penalty_per_second, unix_seconds())
        } else {
            delta
        };
        if delta == 0 {
            return;
        }
        loop {
            let old = self.passive_score.load(Ordering::Acquire);
            let next = (old + delta).clamp(0, 100);
            if self
                .passive_score
                .compare_exchange(old, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Reserve up to `want` points of penalty budget for the given second.
    /// Returns the amount actually granted.
    fn reserve_penalty(&self, want: i32, cap: i32, now_sec: u32) -> i32 {
        loop {
            let packed = self.penalty_window.load(Ordering::Acquire);
            let sec = (packed >> 32) as u32;
            let used = if sec == now_sec { (packed & u32::MAX as u64) as i32 } else { 0 };
            let grant = want.min((cap - used).max(0));
            let next = ((now_sec as u64) << 32) | (used + grant) as u64;
            if self
                .penalty_window
                .compare_exchange(packed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return grant;
            }
        }
    }

    /// Additive effective-weight update clamped to `[min_weight, initial_weight]`.
    /// Used by the recovery sweep; `sync_weight` computes absolute targets instead.
    pub fn update_effective_weight(&self, delta: i32, min_weight: i32) {
        loop {
            let old = self.effective_weight.load(Ordering::Acquire);
            let next = (old + delta).clamp(min_weight.min(self.initial_weight), self.initial_weight);
            if self
                .effective_weight
                .compare_exchange(old, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Project the current scores onto the effective weight.
    ///
    /// The target is `initial_weight * min(passive, active)/100`, shifted by
    /// `conn_delta` when the correction is active. Drops are instantaneous
    /// to shed load; rises move by `initial_weight / 20` per call to damp
    /// oscillation. The stored value stays within
    /// `[min_weight, initial_weight]`.
    pub fn sync_weight(&self, min_weight: i32) {
        let mut target_score = self.passive_score().min(self.active_score()) as f64;
        let cd = self.conn_delta();
        if cd != 0.0 {
            target_score = (target_score + cd).clamp(0.0, 100.0);
        }
        let floor = min_weight.min(self.initial_weight);
        let target = ((self.initial_weight as f64 * target_score / 100.0).floor() as i32)
            .clamp(floor, self.initial_weight);

        let current = self.effective_weight.load(Ordering::Acquire);
        if target < current {
            self.effective_weight.store(target, Ordering::Release);
        } else if target > current {
            let step = self.initial_weight / 20;
            let next = (current + step).min(target);
            self.effective_weight.store(next, Ordering::Release);
        }
    }

    pub fn meta(&self) -> NodeMeta {
        NodeMeta {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.initial_weight,
        }
    }
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
