/// Synchronous result of an SDK API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Failed,
    NoConnection,
    NoSubscription,
    InvalidParam,
    InvalidState,
    /// Service is not (yet) available
    NotReady,
    NotAllowed,
    NotImplemented,
    ConnectionLost,
    Expired,
    /// Request was already made, e.g. listener registered twice
    Already,
    /// No such object, e.g. deregistering an unknown listener
    NoSuch,
    NotSupported,
    NoMemory,
}

impl Status {
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

/// Result carried by the asynchronous response to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    GenericFailure,
    RadioNotAvailable,
    InternalError,
    InvalidArguments,
    OperationNotAllowed,
    NoResources,
    Cancelled,
    SubsystemUnavailable,
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

/// Availability of a service as seen by its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceStatus {
    #[default]
    ServiceUnavailable,
    ServiceAvailable,
    /// Initialization failed for good
    ServiceFailed,
}

impl core::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ServiceStatus::ServiceUnavailable => write!(f, "unavailable"),
            ServiceStatus::ServiceAvailable => write!(f, "available"),
            ServiceStatus::ServiceFailed => write!(f, "failed"),
        }
    }
}
