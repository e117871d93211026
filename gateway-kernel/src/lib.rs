//! Request governance kernel.
//!
//! [`GovernancePipeline`] moves each request through policy evaluation,
//! routing, redaction and auditing; [`GatewayContext`] wires the pipeline,
//! the policy service and the observability handles once at startup, and
//! [`RequestScheduler`] runs every request on its own bounded task.

#![warn(missing_docs, clippy::pedantic)]

pub mod collaborators;
pub mod context;
mod lifecycle;
pub mod pipeline;
mod scheduler;

pub use collaborators::{
    CollaboratorError, PassthroughProcessor, ProcessedResponse, ProviderMetadata, ProviderResponse,
    ProviderRouter, ResponseProcessor, UnconfiguredRouter,
};
pub use context::{ContextError, ContextResult, GatewayContext, GatewayContextBuilder};
pub use lifecycle::{LifecycleError, LifecycleResult, RequestEvent, RequestLifecycle, RequestState};
pub use pipeline::{
    BlockedResponse, GovernancePipeline, PipelineError, PipelineOutcome, PipelineResult,
    ServedResponse,
};
pub use scheduler::{RequestScheduler, SchedulerConfig, SchedulerError, SchedulerResult};
