//! Core building blocks for the telux simulation layer
//!
//! This crate provides the pieces shared by every simulated service:
//! - CommandCallbackManager correlating asynchronous commands with their callbacks
//! - Status, ErrorCode and ServiceStatus result types
//! - ListenerManager for weakly held application listeners
//! - AsyncTaskQueue for ordered execution of application callbacks
//! - Logging setup and debug macros

pub mod cmd_callback;
pub mod debug;
pub mod listener_mgr;
pub mod status;
pub mod task_queue;

// Re-export commonly used items
pub use cmd_callback::{CommandCallback, CommandCallbackManager, CommandId, INVALID_COMMAND_ID, PendingCallback};
pub use listener_mgr::ListenerManager;
pub use status::{ErrorCode, ServiceStatus, Status};
pub use task_queue::AsyncTaskQueue;

/// Generic response callback carrying only the result of the command
pub type ResponseCallback = Box<dyn FnOnce(ErrorCode) + Send + 'static>;

/// Invoked once a manager finished (or failed) its initialization
pub type InitResponseCb = Box<dyn FnOnce(ServiceStatus) + Send + 'static>;
