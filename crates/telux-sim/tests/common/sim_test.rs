use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use telux_config::{CfgService, CfgTransport, SharedConfig, SimConfig};
use telux_core::{InitResponseCb, ServiceStatus};
use telux_sim::{AntennaManager, SimFactory};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Creates a config with short latencies. It can still be modified as needed
/// before passing it to start_manager
pub fn fast_test_config() -> SimConfig {
    SimConfig {
        debug_log: None,
        transport: CfgTransport {
            response_delay_ms: 5,
            response_jitter_ms: 0,
            failure_rate: 0.0,
        },
        service: CfgService {
            init_delay_ms: 5,
            ssr_recovery_ms: 50,
            default_antenna_index: 0,
            antenna_count: 3,
        },
    }
}

/// Obtains the antenna manager through a factory and waits until the service is available
pub fn start_manager(cfg: SimConfig) -> (SimFactory, Arc<AntennaManager>) {
    let config = SharedConfig::from_config(cfg).expect("valid test config");
    let factory = SimFactory::new(config);

    let (tx, rx) = unbounded();
    let init_cb: InitResponseCb = Box::new(move |status| {
        let _ = tx.send(status);
    });
    let mgr = factory.get_antenna_manager(Some(init_cb)).expect("antenna manager");
    assert_eq!(rx.recv_timeout(WAIT), Ok(ServiceStatus::ServiceAvailable));
    assert_eq!(mgr.get_service_status(), ServiceStatus::ServiceAvailable);
    (factory, mgr)
}

/// Polls `cond` until it holds or WAIT passed
pub fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
