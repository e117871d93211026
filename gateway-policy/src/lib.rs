//! Policy model, evaluation, tier enforcement and versioned storage.
//!
//! [`service::PolicyService`] is the entry point for policy management;
//! [`engine::PolicyEngine`] is the seam the request pipeline evaluates through.

#![warn(missing_docs, clippy::pedantic)]

pub mod api;
pub mod contracts;
pub mod decision;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod integrations;
pub mod model;
pub mod service;
pub mod store;
pub mod tier;
pub mod validation;

pub use contracts::{FactValue, PolicyRequest, UserContext};
pub use decision::PolicyEvaluation;
pub use engine::{PolicyEngine, RiskCalculator, StoreBackedEngine};
pub use error::{PolicyError, PolicyResult, PolicyServiceError, ServiceResult, StoreError, StoreResult};
pub use model::{
    Action, ActionType, ChangeType, Condition, Policy, PolicyDraft, PolicyTier, PolicyType,
    PolicyVersionEntry, UpdatePolicyRequest,
};
pub use service::PolicyService;
pub use tier::{EnvLicenseChecker, LicenseChecker, StaticLicense, TierError};
