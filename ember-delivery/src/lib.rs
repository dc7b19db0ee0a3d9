//! Campaign delivery engine
//!
//! This crate turns a started campaign into provider sends:
//! - Materializes per-recipient sends from a recipient source
//! - Dispatches them in batches under per-account rate and concurrency limits
//! - Retries transient provider failures on a fixed backoff schedule
//! - Protects sender reputation with canary batches and a kill-switch
//! - Records provider telemetry and engagement callbacks

pub mod concurrency;
mod error;
pub mod notify;
pub mod policy;
mod processor;
pub mod rate_limiter;
pub mod recipients;
pub mod render;
pub mod risk;
pub mod scheduler;
mod service;
pub mod transport;

pub use concurrency::TenantLimiter;
pub use error::{DeliveryError, RenderError, Result, SystemError, TransportError};
pub use notify::{Notifier, TracingNotifier};
pub use policy::{FailureAction, RetryPolicy};
pub use processor::{
    CampaignProcessor, Collaborators, DispatchConfig, MaterializeConfig, MonitorConfig,
    SendOutcome, dispatch::DispatchOutcome,
};
pub use rate_limiter::{RateDecision, RateLimitConfig, RateLimiter};
pub use recipients::{RecipientSource, StaticRecipientSource};
pub use render::{PlainRenderer, RenderedBody, Renderer};
pub use risk::RiskConfig;
pub use scheduler::{Job, Scheduler};
pub use service::{CampaignReport, CampaignService, EngineStatus};
pub use transport::{LoggingTransport, OutboundMessage, Transport};
