pub mod config;
mod error;
pub mod loopdetect;
pub mod otel;
pub mod pricing;
pub mod providers;
pub mod proxy;
pub mod reconcile;
pub mod runner;
pub mod spend;
pub mod tokens;

pub use error::{Result, SentinelError};

pub use loopdetect::{LoopCheck, LoopDetector};
pub use pricing::{calculate_cost, default_pricing, Pricing, PricingTable};
pub use providers::{AnthropicProvider, GeminiProvider, OpenAiProvider, Provider, TokenUsage};
pub use proxy::{router, ProxyState, DEFAULT_INTERVENTION_HINT, DEFAULT_TENANT_HEADER};
pub use reconcile::{Reservation, Settlement, StreamingReconciler};
pub use runner::BoundedRunner;
pub use spend::{
    GovernanceSnapshot, LimitDecision, RedisSpendStore, SpendAccountant, SpendLedger,
};

#[cfg(unix)]
pub use loopdetect::UdsLoopClient;
