#![warn(missing_docs)]

use crate::tools::DebugToolError;

/// Classifies an [`Error`] for transport inside command responses and error
/// events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or contradictory configuration.
    InvalidConfig,
    /// The debug tool is unresponsive. Suspends the target controller.
    DeviceCommunicationFailure,
    /// The target refused or timed out on a requested operation.
    TargetOperationFailure,
    /// A memory operation fell outside the segment.
    RangeViolation,
    /// Access-mode gating refused the operation.
    AccessDenied,
    /// A flash write was attempted outside a programming session.
    ProgrammingModeRequired,
    /// An axiom check on fuses failed; nothing was written.
    FuseSafetyCheckFailed,
    /// The declared hardware breakpoint slot count was exceeded.
    BreakpointResourceExhausted,
    /// No handler is registered for the command.
    UnknownCommand,
    /// The operation is not supported by the target or tool.
    Unsupported,
    /// An unexpected invariant violation. Transitions to shutdown.
    Fatal,
}

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or contradictory configuration; fatal during startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The debug tool has become unresponsive - we assume Bloom has lost
    /// control of it (disconnected, externally reset, ...).
    #[error("device communication failure: {0}")]
    DeviceCommunicationFailure(String),
    /// The target refused or timed out on a requested operation.
    #[error("target operation failure: {0}")]
    TargetOperationFailure(String),
    /// Activation of the debugWIRE physical interface failed. The DWEN fuse
    /// bit may need updating via the ISP interface.
    #[error("failed to activate the debugWIRE physical interface: {0}")]
    DebugWireActivation(String),
    /// A memory operation fell outside the segment's address range.
    #[error("memory access outside segment bounds: {0}")]
    RangeViolation(String),
    /// The applicable access-mode record forbids the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// A flash write or erase requires an active programming session.
    #[error("an active programming session is required: {0}")]
    ProgrammingModeRequired(String),
    /// A fuse safety check failed; the operation was aborted without writing.
    #[error("fuse safety check failed: {0}")]
    FuseSafetyCheckFailed(String),
    /// The request would exceed the declared hardware breakpoint slot count.
    #[error("breakpoint resources exhausted: {0}")]
    BreakpointResourceExhausted(String),
    /// No handler is registered for this command.
    #[error("no handler registered for this command")]
    UnknownCommand,
    /// The operation is not supported by the connected target or tool.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// A descriptor lookup or validation failed.
    #[error("target descriptor error")]
    Descriptor(#[from] bloom_target::DescriptorError),
    /// Catch-all for unexpected invariant violations.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// The [`ErrorKind`] carried by responses and error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::DeviceCommunicationFailure(_) => ErrorKind::DeviceCommunicationFailure,
            Error::TargetOperationFailure(_) | Error::DebugWireActivation(_) => {
                ErrorKind::TargetOperationFailure
            }
            Error::RangeViolation(_) => ErrorKind::RangeViolation,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::ProgrammingModeRequired(_) => ErrorKind::ProgrammingModeRequired,
            Error::FuseSafetyCheckFailed(_) => ErrorKind::FuseSafetyCheckFailed,
            Error::BreakpointResourceExhausted(_) => ErrorKind::BreakpointResourceExhausted,
            Error::UnknownCommand => ErrorKind::UnknownCommand,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Descriptor(_) => ErrorKind::TargetOperationFailure,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

impl From<DebugToolError> for Error {
    fn from(error: DebugToolError) -> Self {
        Error::DeviceCommunicationFailure(error.to_string())
    }
}
