use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};

use telux_core::{CommandCallback, ErrorCode, ServiceStatus};
use telux_sim::{ActiveAntennaCallback, AntennaListener};

/// Everything a Recorder got told, in order of arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    ActiveAntennaResponse(u8, ErrorCode),
    ActiveAntennaChange(u8),
    ServiceStatus(ServiceStatus),
}

/// Application-side callback object and listener that forwards everything into a channel
pub struct Recorder {
    tx: Sender<Observed>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Receiver<Observed>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl CommandCallback for Recorder {}

impl ActiveAntennaCallback for Recorder {
    fn on_active_antenna_response(&self, index: u8, error: ErrorCode) {
        let _ = self.tx.send(Observed::ActiveAntennaResponse(index, error));
    }
}

impl AntennaListener for Recorder {
    fn on_active_antenna_change(&self, index: u8) {
        let _ = self.tx.send(Observed::ActiveAntennaChange(index));
    }

    fn on_service_status_change(&self, status: ServiceStatus) {
        let _ = self.tx.send(Observed::ServiceStatus(status));
    }
}
