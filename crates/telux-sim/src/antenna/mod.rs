//! Simulated antenna management service

mod antenna_mgr;

pub use antenna_mgr::AntennaManager;

use telux_core::{CommandCallback, ErrorCode, ServiceStatus};

/// Invoked with the active antenna index once a `get_active_antenna` request completes
pub type GetActiveAntCb = Box<dyn FnOnce(u8, ErrorCode) + Send + 'static>;

/// Callback object variant of [`GetActiveAntCb`]. The manager only holds it weakly;
/// if the application drops it before the response arrives, nothing is invoked.
pub trait ActiveAntennaCallback: CommandCallback {
    fn on_active_antenna_response(&self, index: u8, error: ErrorCode);
}

/// Application listener for unsolicited antenna service events
pub trait AntennaListener: Send + Sync {
    fn on_active_antenna_change(&self, _index: u8) {}

    fn on_service_status_change(&self, _status: ServiceStatus) {}
}
