//! Lifecycle events exchanged between the API, workers and the persistence
//! listener.
//!
//! On the wire every event is a JSON object carrying a `type` discriminator,
//! the execution `id` and a `createdAt` RFC3339 timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    CompilerType, DomainError, ExecutionId, ExecutionState, FailureReason, LogsPath,
    ProgrammingLanguage,
};

/// Exit code reported when the worker gave up before the container produced one.
pub const INTERNAL_ERROR_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "CodeExecutionRequestedEvent")]
    Requested(RequestedEvent),
    #[serde(rename = "CodeExecutionStartedEvent")]
    Started(StartedEvent),
    #[serde(rename = "CodeExecutionFinishedEvent")]
    Finished(FinishedEvent),
}

impl ExecutionEvent {
    pub fn id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::Requested(event) => event.id,
            ExecutionEvent::Started(event) => event.id,
            ExecutionEvent::Finished(event) => event.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ExecutionEvent::Requested(event) => event.created_at,
            ExecutionEvent::Started(event) => event.created_at,
            ExecutionEvent::Finished(event) => event.created_at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::Requested(_) => "CodeExecutionRequestedEvent",
            ExecutionEvent::Started(_) => "CodeExecutionStartedEvent",
            ExecutionEvent::Finished(_) => "CodeExecutionFinishedEvent",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

impl From<RequestedEvent> for ExecutionEvent {
    fn from(event: RequestedEvent) -> Self {
        ExecutionEvent::Requested(event)
    }
}

impl From<StartedEvent> for ExecutionEvent {
    fn from(event: StartedEvent) -> Self {
        ExecutionEvent::Started(event)
    }
}

impl From<FinishedEvent> for ExecutionEvent {
    fn from(event: FinishedEvent) -> Self {
        ExecutionEvent::Finished(event)
    }
}

/// Submission of a new execution, produced by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedEvent {
    pub id: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub language: ProgrammingLanguage,
    pub compiler: CompilerType,
    pub source_code_path: String,
}

/// Published by a worker before touching the container engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedEvent {
    pub id: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub logs_path: LogsPath,
}

/// Terminal outcome of an execution.
///
/// Only obtainable through [`FinishedEvent::new`], decoding included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FinishedEventFields", into = "FinishedEventFields")]
pub struct FinishedEvent {
    id: ExecutionId,
    created_at: DateTime<Utc>,
    state: ExecutionState,
    exit_code: i64,
    failure_reason: FailureReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishedEventFields {
    id: ExecutionId,
    created_at: DateTime<Utc>,
    state: ExecutionState,
    exit_code: i64,
    #[serde(default)]
    failure_reason: FailureReason,
}

impl FinishedEvent {
    pub fn new(
        id: ExecutionId,
        created_at: DateTime<Utc>,
        state: ExecutionState,
        exit_code: i64,
        failure_reason: FailureReason,
    ) -> Result<Self, DomainError> {
        if !state.is_final() {
            return Err(DomainError::NotFinal(state));
        }
        match (state, failure_reason) {
            (ExecutionState::Failed, FailureReason::None) => {
                return Err(DomainError::MissingFailureReason)
            }
            (ExecutionState::Completed, reason) if reason != FailureReason::None => {
                return Err(DomainError::UnexpectedFailureReason(state))
            }
            _ => {}
        }

        Ok(Self {
            id,
            created_at,
            state,
            exit_code,
            failure_reason,
        })
    }

    /// Outcome reported when the pipeline itself broke down.
    pub fn internal_error(id: ExecutionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            state: ExecutionState::Failed,
            exit_code: INTERNAL_ERROR_EXIT_CODE,
            failure_reason: FailureReason::InternalError,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.failure_reason
    }
}

impl TryFrom<FinishedEventFields> for FinishedEvent {
    type Error = DomainError;

    fn try_from(fields: FinishedEventFields) -> Result<Self, Self::Error> {
        Self::new(
            fields.id,
            fields.created_at,
            fields.state,
            fields.exit_code,
            fields.failure_reason,
        )
    }
}

impl From<FinishedEvent> for FinishedEventFields {
    fn from(event: FinishedEvent) -> Self {
        Self {
            id: event.id,
            created_at: event.created_at,
            state: event.state,
            exit_code: event.exit_code,
            failure_reason: event.failure_reason,
        }
    }
}
