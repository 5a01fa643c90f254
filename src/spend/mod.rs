//! Per-tenant spend accounting. The ledger owns all bucket state in the
//! external store; the accountant wraps it with fail-open semantics so
//! governance never drops traffic when the store is unhealthy.

mod store;

pub use store::RedisSpendStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Outcome of an atomic check-and-reserve, as seen by this request.
/// `remaining` is the budget before the reservation was added.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub current_spend: f64,
    pub limit: f64,
    pub remaining: f64,
}

impl LimitDecision {
    fn fail_open(default_limit: f64) -> Self {
        Self {
            allowed: true,
            current_spend: 0.0,
            limit: default_limit,
            remaining: default_limit,
        }
    }
}

/// Atomic operations against the tenant's sliding-window spend state. Every
/// mutation executes server-side as one unit; concurrent callers observe
/// linearizable per-tenant state.
#[async_trait]
pub trait SpendLedger: Send + Sync {
    async fn check_and_reserve(&self, tenant: &str, estimated_cost: f64) -> Result<LimitDecision>;

    /// Adds `actual - estimate` to the current minute bucket. A zero delta
    /// is a no-op.
    async fn adjust_cost(&self, tenant: &str, estimate: f64, actual: f64) -> Result<()>;

    async fn refund_estimate(&self, tenant: &str, estimate: f64) -> Result<()> {
        self.adjust_cost(tenant, estimate, 0.0).await
    }

    /// Diagnostic: sum of buckets in the last hour. Not in the hot path.
    async fn get_spend(&self, tenant: &str) -> Result<f64>;

    /// Diagnostic: the tenant's limit, or the default when unset.
    async fn get_limit(&self, tenant: &str) -> Result<f64>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GovernanceSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
    pub adjustments: u64,
    pub refunds: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct GovernanceMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
    adjustments: AtomicU64,
    refunds: AtomicU64,
    store_errors: AtomicU64,
}

impl GovernanceMetrics {
    fn snapshot(&self) -> GovernanceSnapshot {
        GovernanceSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
            refunds: self.refunds.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Fail-open facade over a [`SpendLedger`]. Ledger failures log at warn,
/// bump a counter, and resolve as though the check had allowed the request;
/// no error ever reaches the request path.
pub struct SpendAccountant {
    ledger: Arc<dyn SpendLedger>,
    default_limit: f64,
    metrics: GovernanceMetrics,
}

impl SpendAccountant {
    pub fn new(ledger: Arc<dyn SpendLedger>, default_limit: f64) -> Self {
        Self {
            ledger,
            default_limit,
            metrics: GovernanceMetrics::default(),
        }
    }

    pub fn default_limit(&self) -> f64 {
        self.default_limit
    }

    pub fn snapshot(&self) -> GovernanceSnapshot {
        self.metrics.snapshot()
    }

    pub async fn check_and_reserve(&self, tenant: &str, estimated_cost: f64) -> LimitDecision {
        match self.ledger.check_and_reserve(tenant, estimated_cost).await {
            Ok(decision) => {
                if decision.allowed {
                    self.metrics.allowed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.denied.fetch_add(1, Ordering::Relaxed);
                }
                decision
            }
            Err(err) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    tenant_id = %tenant,
                    "spend check failed, failing open"
                );
                LimitDecision::fail_open(self.default_limit)
            }
        }
    }

    pub async fn adjust_cost(&self, tenant: &str, estimate: f64, actual: f64) {
        match self.ledger.adjust_cost(tenant, estimate, actual).await {
            Ok(()) => {
                self.metrics.adjustments.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tenant_id = %tenant,
                    estimate,
                    actual,
                    "cost adjusted"
                );
            }
            Err(err) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    tenant_id = %tenant,
                    estimate,
                    actual,
                    "failed to adjust cost"
                );
            }
        }
    }

    pub async fn refund_estimate(&self, tenant: &str, estimate: f64) {
        match self.ledger.refund_estimate(tenant, estimate).await {
            Ok(()) => {
                self.metrics.refunds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tenant_id = %tenant, estimate, "estimate refunded");
            }
            Err(err) => {
                self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    tenant_id = %tenant,
                    estimate,
                    "failed to refund estimate"
                );
            }
        }
    }
}
