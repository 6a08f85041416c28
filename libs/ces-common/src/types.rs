use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::events::ExecutionEvent;

pub const SOURCE_FILE_NAME: &str = "source";
pub const ALL_LOGS_FILE_NAME: &str = "all_logs";
pub const STDOUT_LOGS_FILE_NAME: &str = "stdout_logs";
pub const STDERR_LOGS_FILE_NAME: &str = "stderr_logs";

/// Execution identity, generated once at submission.
/// Serialized as a plain UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ExecutionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgrammingLanguage {
    CSharp,
}

impl fmt::Display for ProgrammingLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgrammingLanguage::CSharp => write!(f, "C_SHARP"),
        }
    }
}

/// Compiler (and runtime) a request is built with.
/// The sandbox image currently bundles a single toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompilerType {
    Mono,
}

impl CompilerType {
    pub fn supported_languages(&self) -> &'static [ProgrammingLanguage] {
        match self {
            CompilerType::Mono => &[ProgrammingLanguage::CSharp],
        }
    }

    pub fn supports(&self, language: ProgrammingLanguage) -> bool {
        self.supported_languages().contains(&language)
    }
}

impl fmt::Display for CompilerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerType::Mono => write!(f, "MONO"),
        }
    }
}

/// Execution State Machine
/// CREATED → STARTED → {COMPLETED | FAILED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Started,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn is_final(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Created => "CREATED",
            ExecutionState::Started => "STARTED",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    #[default]
    None,
    TimeLimitExceeded,
    NonZeroExitCode,
    InternalError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::None => "NONE",
            FailureReason::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            FailureReason::NonZeroExitCode => "NON_ZERO_EXIT_CODE",
            FailureReason::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Artifact keys holding the combined, stdout and stderr output of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsPath {
    pub all_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
}

impl LogsPath {
    /// Deterministic locations for an execution, namespaced by its id.
    pub fn for_execution(id: ExecutionId) -> Self {
        Self {
            all_path: format!("{}/{}", id, ALL_LOGS_FILE_NAME),
            stdout_path: format!("{}/{}", id, STDOUT_LOGS_FILE_NAME),
            stderr_path: format!("{}/{}", id, STDERR_LOGS_FILE_NAME),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.all_path, &self.stdout_path, &self.stderr_path]
    }
}

/// Source key for an execution's uploaded code.
pub fn source_path(id: ExecutionId) -> String {
    format!("{}/{}", id, SOURCE_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("compiler '{compiler}' does not support '{language}' language")]
    UnsupportedLanguage {
        compiler: CompilerType,
        language: ProgrammingLanguage,
    },
    #[error("failureReason must be set for failed state")]
    MissingFailureReason,
    #[error("failureReason must be empty for {0} state")]
    UnexpectedFailureReason(ExecutionState),
    #[error("finishedAt must be set for final state")]
    MissingFinishedAt,
    #[error("finishedAt must be empty for {0} state")]
    UnexpectedFinishedAt(ExecutionState),
    #[error("exitCode must be set for final state")]
    MissingExitCode,
    #[error("exitCode must be empty for {0} state")]
    UnexpectedExitCode(ExecutionState),
    #[error("logsPath must be set for {0} state")]
    MissingLogsPath(ExecutionState),
    #[error("logsPath must be empty for {0} state")]
    UnexpectedLogsPath(ExecutionState),
    #[error("state must be final, got {0}")]
    NotFinal(ExecutionState),
    #[error("event for {event} cannot be applied to execution {execution}")]
    ForeignEvent {
        execution: ExecutionId,
        event: ExecutionId,
    },
    #[error("{event} cannot be applied in {state} state")]
    IllegalTransition {
        state: ExecutionState,
        event: &'static str,
    },
}

/// Raw persisted shape of an execution. Only becomes a `CodeExecution`
/// after passing validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionRecord {
    pub id: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub source_code_path: String,
    pub language: ProgrammingLanguage,
    pub compiler: CompilerType,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub logs_path: Option<LogsPath>,
    #[serde(default)]
    pub failure_reason: FailureReason,
}

/// Code execution aggregate.
///
/// Immutable: every transition produces a new value that has passed the same
/// validation as construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CodeExecutionRecord", into = "CodeExecutionRecord")]
pub struct CodeExecution {
    record: CodeExecutionRecord,
}

impl CodeExecution {
    /// A freshly submitted execution.
    pub fn submitted(
        id: ExecutionId,
        created_at: DateTime<Utc>,
        source_code_path: impl Into<String>,
        language: ProgrammingLanguage,
        compiler: CompilerType,
    ) -> Result<Self, DomainError> {
        Self::try_from(CodeExecutionRecord {
            id,
            created_at,
            state: ExecutionState::Created,
            source_code_path: source_code_path.into(),
            language,
            compiler,
            finished_at: None,
            exit_code: None,
            logs_path: None,
            failure_reason: FailureReason::None,
        })
    }

    pub fn id(&self) -> ExecutionId {
        self.record.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn state(&self) -> ExecutionState {
        self.record.state
    }

    pub fn source_code_path(&self) -> &str {
        &self.record.source_code_path
    }

    pub fn language(&self) -> ProgrammingLanguage {
        self.record.language
    }

    pub fn compiler(&self) -> CompilerType {
        self.record.compiler
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.record.finished_at
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.record.exit_code
    }

    pub fn logs_path(&self) -> Option<&LogsPath> {
        self.record.logs_path.as_ref()
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.record.failure_reason
    }

    pub fn record(&self) -> &CodeExecutionRecord {
        &self.record
    }

    /// Applies a lifecycle event coming back from a worker.
    ///
    /// A finished event may arrive for an execution still in `CREATED` when the
    /// worker failed before announcing the start; log locations are then
    /// derived from the id since they are deterministic.
    pub fn apply(&self, event: &ExecutionEvent) -> Result<Self, DomainError> {
        if event.id() != self.id() {
            return Err(DomainError::ForeignEvent {
                execution: self.id(),
                event: event.id(),
            });
        }

        let state = self.state();
        let mut next = self.record.clone();
        match event {
            ExecutionEvent::Requested(_) => {
                return Err(DomainError::IllegalTransition {
                    state,
                    event: event.kind(),
                });
            }
            ExecutionEvent::Started(started) => {
                if state != ExecutionState::Created {
                    return Err(DomainError::IllegalTransition {
                        state,
                        event: event.kind(),
                    });
                }
                next.state = ExecutionState::Started;
                next.logs_path = Some(started.logs_path.clone());
            }
            ExecutionEvent::Finished(finished) => {
                if state.is_final() {
                    return Err(DomainError::IllegalTransition {
                        state,
                        event: event.kind(),
                    });
                }
                next.state = finished.state();
                next.exit_code = Some(finished.exit_code());
                next.failure_reason = finished.failure_reason();
                next.finished_at = Some(finished.created_at());
                if next.logs_path.is_none() {
                    next.logs_path = Some(LogsPath::for_execution(self.id()));
                }
            }
        }

        Self::try_from(next)
    }

    fn validate(record: &CodeExecutionRecord) -> Result<(), DomainError> {
        let state = record.state;

        if !record.compiler.supports(record.language) {
            return Err(DomainError::UnsupportedLanguage {
                compiler: record.compiler,
                language: record.language,
            });
        }

        match (state, record.failure_reason) {
            (ExecutionState::Failed, FailureReason::None) => {
                return Err(DomainError::MissingFailureReason)
            }
            (ExecutionState::Failed, _) | (_, FailureReason::None) => {}
            (state, _) => return Err(DomainError::UnexpectedFailureReason(state)),
        }

        match (state.is_final(), record.finished_at.is_some()) {
            (true, false) => return Err(DomainError::MissingFinishedAt),
            (false, true) => return Err(DomainError::UnexpectedFinishedAt(state)),
            _ => {}
        }

        match (state.is_final(), record.exit_code.is_some()) {
            (true, false) => return Err(DomainError::MissingExitCode),
            (false, true) => return Err(DomainError::UnexpectedExitCode(state)),
            _ => {}
        }

        match (state == ExecutionState::Created, record.logs_path.is_some()) {
            (true, true) => return Err(DomainError::UnexpectedLogsPath(state)),
            (false, false) => return Err(DomainError::MissingLogsPath(state)),
            _ => {}
        }

        Ok(())
    }
}

impl TryFrom<CodeExecutionRecord> for CodeExecution {
    type Error = DomainError;

    fn try_from(record: CodeExecutionRecord) -> Result<Self, Self::Error> {
        Self::validate(&record)?;
        Ok(Self { record })
    }
}

impl From<CodeExecution> for CodeExecutionRecord {
    fn from(execution: CodeExecution) -> Self {
        execution.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FinishedEvent, StartedEvent};

    fn submitted() -> CodeExecution {
        CodeExecution::submitted(
            ExecutionId::random(),
            Utc::now(),
            "some/source",
            ProgrammingLanguage::CSharp,
            CompilerType::Mono,
        )
        .unwrap()
    }

    fn record(state: ExecutionState) -> CodeExecutionRecord {
        let id = ExecutionId::random();
        CodeExecutionRecord {
            id,
            created_at: Utc::now(),
            state,
            source_code_path: source_path(id),
            language: ProgrammingLanguage::CSharp,
            compiler: CompilerType::Mono,
            finished_at: None,
            exit_code: None,
            logs_path: None,
            failure_reason: FailureReason::None,
        }
    }

    #[test]
    fn test_language_serialization() {
        let json = serde_json::to_string(&ProgrammingLanguage::CSharp).unwrap();
        assert_eq!(json, "\"C_SHARP\"");
        let json = serde_json::to_string(&FailureReason::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"TIME_LIMIT_EXCEEDED\"");
    }

    #[test]
    fn test_execution_id_is_plain_uuid_string() {
        let id = ExecutionId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn test_compiler_supports_language() {
        assert!(CompilerType::Mono.supports(ProgrammingLanguage::CSharp));
    }

    #[test]
    fn test_state_finality() {
        assert!(!ExecutionState::Created.is_final());
        assert!(!ExecutionState::Started.is_final());
        assert!(ExecutionState::Completed.is_final());
        assert!(ExecutionState::Failed.is_final());
    }

    #[test]
    fn test_logs_path_is_namespaced_by_id() {
        let id = ExecutionId::random();
        let path = LogsPath::for_execution(id);
        assert_eq!(path.all_path, format!("{}/all_logs", id));
        assert_eq!(path.stdout_path, format!("{}/stdout_logs", id));
        assert_eq!(path.stderr_path, format!("{}/stderr_logs", id));
    }

    #[test]
    fn test_submitted_execution_is_created() {
        let execution = submitted();
        assert_eq!(execution.state(), ExecutionState::Created);
        assert!(execution.logs_path().is_none());
        assert!(execution.exit_code().is_none());
    }

    #[test]
    fn test_failed_requires_failure_reason() {
        let mut raw = record(ExecutionState::Failed);
        raw.finished_at = Some(Utc::now());
        raw.exit_code = Some(1);
        raw.logs_path = Some(LogsPath::for_execution(raw.id));

        assert_eq!(
            CodeExecution::try_from(raw.clone()),
            Err(DomainError::MissingFailureReason)
        );

        raw.failure_reason = FailureReason::NonZeroExitCode;
        assert!(CodeExecution::try_from(raw).is_ok());
    }

    #[test]
    fn test_failure_reason_only_for_failed() {
        let mut raw = record(ExecutionState::Completed);
        raw.finished_at = Some(Utc::now());
        raw.exit_code = Some(0);
        raw.logs_path = Some(LogsPath::for_execution(raw.id));
        raw.failure_reason = FailureReason::InternalError;

        assert_eq!(
            CodeExecution::try_from(raw),
            Err(DomainError::UnexpectedFailureReason(ExecutionState::Completed))
        );
    }

    #[test]
    fn test_final_state_requires_finished_at_and_exit_code() {
        let mut raw = record(ExecutionState::Completed);
        raw.logs_path = Some(LogsPath::for_execution(raw.id));
        raw.exit_code = Some(0);
        assert_eq!(
            CodeExecution::try_from(raw.clone()),
            Err(DomainError::MissingFinishedAt)
        );

        raw.finished_at = Some(Utc::now());
        raw.exit_code = None;
        assert_eq!(
            CodeExecution::try_from(raw),
            Err(DomainError::MissingExitCode)
        );
    }

    #[test]
    fn test_non_final_state_rejects_finished_at_and_exit_code() {
        let mut raw = record(ExecutionState::Started);
        raw.logs_path = Some(LogsPath::for_execution(raw.id));
        raw.exit_code = Some(0);
        assert_eq!(
            CodeExecution::try_from(raw.clone()),
            Err(DomainError::UnexpectedExitCode(ExecutionState::Started))
        );

        raw.exit_code = None;
        raw.finished_at = Some(Utc::now());
        assert_eq!(
            CodeExecution::try_from(raw),
            Err(DomainError::UnexpectedFinishedAt(ExecutionState::Started))
        );
    }

    #[test]
    fn test_logs_path_presence_follows_state() {
        let mut created = record(ExecutionState::Created);
        created.logs_path = Some(LogsPath::for_execution(created.id));
        assert_eq!(
            CodeExecution::try_from(created),
            Err(DomainError::UnexpectedLogsPath(ExecutionState::Created))
        );

        let started = record(ExecutionState::Started);
        assert_eq!(
            CodeExecution::try_from(started),
            Err(DomainError::MissingLogsPath(ExecutionState::Started))
        );
    }

    #[test]
    fn test_apply_lifecycle_events() {
        let execution = submitted();
        let id = execution.id();
        let logs_path = LogsPath::for_execution(id);

        let started = execution
            .apply(&ExecutionEvent::Started(StartedEvent {
                id,
                created_at: Utc::now(),
                logs_path: logs_path.clone(),
            }))
            .unwrap();
        assert_eq!(started.state(), ExecutionState::Started);
        assert_eq!(started.logs_path(), Some(&logs_path));

        let finished_at = Utc::now();
        let finished = started
            .apply(&ExecutionEvent::Finished(
                FinishedEvent::new(
                    id,
                    finished_at,
                    ExecutionState::Failed,
                    10,
                    FailureReason::NonZeroExitCode,
                )
                .unwrap(),
            ))
            .unwrap();
        assert_eq!(finished.state(), ExecutionState::Failed);
        assert_eq!(finished.exit_code(), Some(10));
        assert_eq!(finished.finished_at(), Some(finished_at));
        assert_eq!(finished.failure_reason(), FailureReason::NonZeroExitCode);
    }

    #[test]
    fn test_terminal_execution_is_immutable() {
        let execution = submitted();
        let id = execution.id();
        let finished_event = ExecutionEvent::Finished(
            FinishedEvent::new(id, Utc::now(), ExecutionState::Completed, 0, FailureReason::None)
                .unwrap(),
        );
        let finished = execution.apply(&finished_event).unwrap();

        assert_eq!(finished.state(), ExecutionState::Completed);
        assert_eq!(finished.logs_path(), Some(&LogsPath::for_execution(id)));
        assert_eq!(
            finished.apply(&finished_event),
            Err(DomainError::IllegalTransition {
                state: ExecutionState::Completed,
                event: "CodeExecutionFinishedEvent",
            })
        );
    }

    #[test]
    fn test_apply_rejects_foreign_event() {
        let execution = submitted();
        let other = ExecutionId::random();
        let event = ExecutionEvent::Started(StartedEvent {
            id: other,
            created_at: Utc::now(),
            logs_path: LogsPath::for_execution(other),
        });

        assert!(matches!(
            execution.apply(&event),
            Err(DomainError::ForeignEvent { .. })
        ));
    }

    #[test]
    fn test_deserialization_validates() {
        let id = ExecutionId::random();
        let json = serde_json::json!({
            "id": id,
            "createdAt": "2024-01-01T00:00:00Z",
            "state": "FAILED",
            "sourceCodePath": source_path(id),
            "language": "C_SHARP",
            "compiler": "MONO",
            "finishedAt": "2024-01-01T00:00:05Z",
            "exitCode": 1,
            "logsPath": LogsPath::for_execution(id),
        });

        let result: Result<CodeExecution, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }
}
