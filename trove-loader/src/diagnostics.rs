use trove_base::OperationId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticEventType {
    // An operation was created and started
    Create,
    // Progress of an in-flight operation, value is percent complete (0-100)
    PercentComplete,
    // An operation succeeded
    Complete,
    // The reference count changed, value is the new count
    ReferenceCount,
    // An operation was destroyed
    Destroy,
    // An operation failed
    Fail,
}

/// Emitted to the configured diagnostics callback as operations move through their lifecycle
#[derive(Clone, Debug)]
pub struct DiagnosticEvent {
    pub event_type: DiagnosticEventType,
    pub operation: OperationId,
    pub display_name: String,
    pub dependencies: Vec<OperationId>,
    // Number of times update() has been called on the manager
    pub frame: u64,
    pub value: i64,
}
