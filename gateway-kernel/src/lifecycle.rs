//! Per-request state machine of the governance pipeline.

use gateway_primitives::RequestId;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// States a governed request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Accepted by the gateway, nothing evaluated yet.
    Received,
    /// Policies evaluated; the decision is known.
    PolicyEvaluated,
    /// A policy refused the request. Routing never happens from here.
    Blocked,
    /// Handed to a provider.
    Routed,
    /// The audit entry has been offered to the audit queue.
    Audited,
    /// Final state.
    Completed,
}

impl RequestState {
    /// Returns `true` once the request has completed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Events that drive [`RequestLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    /// Policy evaluation finished.
    Evaluate,
    /// Evaluation refused the request.
    Block,
    /// Evaluation allowed the request and routing starts.
    Route,
    /// The audit entry was produced.
    Audit,
    /// The response was handed back.
    Complete,
}

/// Tracks the state of one request.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    request_id: RequestId,
    state: RequestState,
}

impl RequestLifecycle {
    /// Starts a lifecycle in [`RequestState::Received`].
    #[must_use]
    pub const fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: RequestState::Received,
        }
    }

    /// Returns the request identifier.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// An evaluation failure audits straight from `Received`; a routing
    /// failure audits from `Routed`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: RequestEvent) -> LifecycleResult<RequestState> {
        let next = match (self.state, event) {
            (RequestState::Received, RequestEvent::Evaluate) => Some(RequestState::PolicyEvaluated),
            (RequestState::PolicyEvaluated, RequestEvent::Block) => Some(RequestState::Blocked),
            (RequestState::PolicyEvaluated, RequestEvent::Route) => Some(RequestState::Routed),
            (RequestState::Received | RequestState::Blocked | RequestState::Routed, RequestEvent::Audit) => {
                Some(RequestState::Audited)
            }
            (RequestState::Audited, RequestEvent::Complete) => Some(RequestState::Completed),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.state,
                event,
            });
        };

        debug!(
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next_state,
            ?event,
            "request transition"
        );
        self.state = next_state;
        Ok(self.state)
    }
}

/// Errors emitted by the request lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid request transition from {from:?} via {event:?} for request {request_id}")]
    InvalidTransition {
        /// Request whose transition failed.
        request_id: RequestId,
        /// State prior to the attempted transition.
        from: RequestState,
        /// Event that was refused.
        event: RequestEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
