//! Warden Pressure - memory-pressure control for one engine instance
//!
//! The control loop, leaves first:
//! - [`ResourceSampler`] reads memory and load in bounded time
//! - [`EscalationPolicy`] maps a sample to a [`ResponseTier`] with cooldown
//! - [`ResponseController`] applies the tier's remediations
//! - [`HungOperationMonitor`] stops operations that outlive their budget
//!
//! [`ResponseTier`]: warden_core::ResponseTier

#![warn(unreachable_pub)]

pub mod controller;
pub mod hung;
pub mod policy;
pub mod queue;
pub mod remediation;
pub mod sampler;

pub use controller::{
    CleanupReport, ControllerState, ControllerStatus, OperationCanceller, ReliefReport,
    ReliefStep, ResponseController, TickOutcome,
};
pub use hung::{
    HungOperationMonitor, HungOutcome, MonitorStats, OperationTicket, StopStrategy,
    StrategyAttempt, SweepReport,
};
pub use policy::EscalationPolicy;
pub use queue::{QueryQueue, QueuePermit};
pub use remediation::{OriginalLimits, RemediationPlan};
pub use sampler::{ActiveOperationSource, ResourceSampler, SamplerStats, DEFAULT_READ_TIMEOUT};
