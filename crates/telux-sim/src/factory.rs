use std::sync::{Arc, Mutex, PoisonError, Weak};

use telux_config::SharedConfig;
use telux_core::{InitResponseCb, ServiceStatus};

use crate::antenna::AntennaManager;

/// Entry point handing out service managers.
///
/// Managers are cached weakly: as long as the application holds a manager, every
/// caller gets the same instance. Once all handles are dropped the next request
/// creates a fresh one.
pub struct SimFactory {
    config: SharedConfig,
    antenna_mgr: Mutex<Weak<AntennaManager>>,
}

impl SimFactory {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            antenna_mgr: Mutex::new(Weak::new()),
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Returns the antenna manager, creating it if needed. `init_cb` is invoked
    /// exactly once, with ServiceAvailable, or with ServiceFailed if the manager
    /// could not be created.
    pub fn get_antenna_manager(&self, init_cb: Option<InitResponseCb>) -> Option<Arc<AntennaManager>> {
        self.get_or_create(init_cb, AntennaManager::new)
    }

    fn get_or_create<F>(&self, init_cb: Option<InitResponseCb>, create: F) -> Option<Arc<AntennaManager>>
    where
        F: FnOnce(SharedConfig) -> std::io::Result<Arc<AntennaManager>>,
    {
        let created = {
            let mut cached = self.antenna_mgr.lock().unwrap_or_else(PoisonError::into_inner);
            match cached.upgrade() {
                Some(mgr) => Ok(mgr),
                None => create(self.config.clone()).map(|mgr| {
                    tracing::debug!("antenna manager created");
                    *cached = Arc::downgrade(&mgr);
                    mgr
                }),
            }
        };

        // Callbacks run without the cache lock, they may come back to the factory
        match created {
            Ok(mgr) => {
                if let Some(init_cb) = init_cb {
                    mgr.on_init_complete(init_cb);
                }
                Some(mgr)
            }
            Err(e) => {
                tracing::error!("failed to create antenna manager: {}", e);
                if let Some(init_cb) = init_cb {
                    init_cb(ServiceStatus::ServiceFailed);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use telux_config::SimConfig;
    use telux_core::debug;

    use super::*;

    #[test]
    fn test_failed_init_callback_may_use_factory() {
        debug::setup_logging_verbose();
        let config = SharedConfig::from_config(SimConfig::default()).expect("valid default config");
        let factory = Arc::new(SimFactory::new(config));

        let (tx, rx) = unbounded();
        let reentrant = Arc::clone(&factory);
        let init_cb: InitResponseCb = Box::new(move |status| {
            // Runs on the caller's thread, a held cache lock would deadlock here
            let retried = reentrant.get_or_create(None, |_| Err(io::Error::other("still failing")));
            let _ = tx.send((status, retried.is_none()));
        });

        let mgr = factory.get_or_create(Some(init_cb), |_| Err(io::Error::other("no worker thread")));
        assert!(mgr.is_none());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((ServiceStatus::ServiceFailed, true)));
    }
}

