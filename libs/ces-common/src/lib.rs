pub mod types;
pub mod events;
pub mod queue;
pub mod redis;
pub mod memory;
pub mod config;

// Re-export commonly used types for convenience
pub use config::QueueConfig;
pub use events::{ExecutionEvent, FinishedEvent, RequestedEvent, StartedEvent};
pub use queue::{
    Broker, DeliveryId, Publisher, QueueError, ReceiveQueue, ReceivedMessage, ReliableQueue,
    SendQueue,
};
pub use types::{
    CodeExecution, CompilerType, DomainError, ExecutionId, ExecutionState, FailureReason,
    LogsPath, ProgrammingLanguage,
};
