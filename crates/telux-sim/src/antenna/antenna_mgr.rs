use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crossbeam_channel::{Receiver, unbounded};

use telux_config::SharedConfig;
use telux_core::{
    AsyncTaskQueue, CommandCallbackManager, CommandId, ErrorCode, INVALID_COMMAND_ID, InitResponseCb, ListenerManager,
    PendingCallback, ResponseCallback, ServiceStatus, Status,
};

use super::{ActiveAntennaCallback, AntennaListener, GetActiveAntCb};
use crate::transport::{Request, ResponseData, SimTransport, TransportEvent, cmd_id_from_cookie, cookie_from_cmd_id};

struct ServiceState {
    status: ServiceStatus,
    /// Set once the first Available/Failed status was seen
    init_done: bool,
    init_callbacks: Vec<InitResponseCb>,
    /// Bumped whenever the service goes unavailable, i.e. whenever the registry is reset
    epoch: u64,
}

/// State shared between the manager and its dispatcher thread
struct Shared {
    cmd_callbacks: CommandCallbackManager<dyn ActiveAntennaCallback>,
    listeners: ListenerManager<dyn AntennaListener>,
    task_queue: AsyncTaskQueue,
    service: Mutex<ServiceState>,
    /// Responses taken from the registry whose callback has not returned yet
    deliveries: Arc<AtomicUsize>,
}

impl Shared {
    fn new() -> Self {
        Self {
            cmd_callbacks: CommandCallbackManager::new(),
            listeners: ListenerManager::new(),
            task_queue: AsyncTaskQueue::new("antenna-callbacks"),
            service: Mutex::new(ServiceState {
                status: ServiceStatus::ServiceUnavailable,
                init_done: false,
                init_callbacks: Vec::new(),
                epoch: 0,
            }),
            deliveries: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock_service(&self) -> MutexGuard<'_, ServiceState> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `task` on the callback queue
    fn post<F>(&self, what: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let status = self.task_queue.add(task);
        if !status.is_success() {
            tracing::warn!("dropping {}: task queue returned {:?}", what, status);
        }
    }

    /// Runs a response callback on the queue. It stays counted in `deliveries` until it returned.
    fn deliver<F>(&self, what: &str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deliveries = Arc::clone(&self.deliveries);
        let status = self.task_queue.add(move || {
            task();
            deliveries.fetch_sub(1, Ordering::SeqCst);
        });
        if !status.is_success() {
            self.deliveries.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("dropping {}: task queue returned {:?}", what, status);
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ServiceStatus(status) => self.on_service_status(status),
            TransportEvent::Response { cookie, error, data } => self.on_response(cmd_id_from_cookie(cookie), error, data),
            TransportEvent::ActiveAntennaChanged(index) => self.on_active_antenna_change(index),
        }
    }

    fn on_service_status(&self, status: ServiceStatus) {
        let init_callbacks = {
            let mut service = self.lock_service();
            if service.status == status {
                tracing::debug!("service status {} repeated, ignored", status);
                return;
            }
            service.status = status;
            if status == ServiceStatus::ServiceUnavailable {
                service.epoch += 1;
            }
            if !service.init_done && status != ServiceStatus::ServiceUnavailable {
                service.init_done = true;
                std::mem::take(&mut service.init_callbacks)
            } else {
                Vec::new()
            }
        };
        tracing::info!("antenna service {}", status);

        if status == ServiceStatus::ServiceUnavailable {
            // Responses to anything issued before the restart will never come. Ids restart
            // at 1, so a request registered before this point must not reach the transport
            // afterwards; AntennaManager::send checks the epoch for that.
            let dropped = self.cmd_callbacks.pending_count();
            self.cmd_callbacks.reset();
            tracing::info!("SSR: dropped {} pending command callbacks", dropped);
        }

        for init_cb in init_callbacks {
            self.post("init callback", move || init_cb(status));
        }

        let listeners = self.listeners.get_available_listeners();
        if !listeners.is_empty() {
            self.post("service status indication", move || {
                for listener in listeners {
                    listener.on_service_status_change(status);
                }
            });
        }
    }

    fn on_response(&self, cmd_id: CommandId, error: ErrorCode, data: ResponseData) {
        if cmd_id == INVALID_COMMAND_ID {
            tracing::debug!("<- {:?} {:?}, no callback requested", data, error);
            return;
        }

        // Counted before the entry leaves the registry, so the command never looks settled in between
        self.deliveries.fetch_add(1, Ordering::SeqCst);

        let delivered = match data {
            ResponseData::SetActiveAntenna => match self.cmd_callbacks.take_closure::<ResponseCallback>(cmd_id) {
                Some(cb) => {
                    self.deliver("set active antenna response", move || cb(error));
                    true
                }
                None => false,
            },
            ResponseData::ActiveAntenna(index) => match self.cmd_callbacks.take(cmd_id) {
                Some(PendingCallback::Object(obj)) => {
                    self.deliver("active antenna response", move || obj.on_active_antenna_response(index, error));
                    true
                }
                Some(callback) => match callback.into_closure::<GetActiveAntCb>() {
                    Some(cb) => {
                        self.deliver("active antenna response", move || cb(index, error));
                        true
                    }
                    None => false,
                },
                None => false,
            },
        };

        if delivered {
            tracing::debug!(cmd_id, "<- {:?} {:?}", data, error);
        } else {
            self.deliveries.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(cmd_id, "<- {:?} for unknown or expired command, dropped", data);
        }
    }

    fn on_active_antenna_change(&self, index: u8) {
        let listeners = self.listeners.get_available_listeners();
        tracing::debug!("<- active antenna changed to {}, {} listeners", index, listeners.len());
        if listeners.is_empty() {
            return;
        }
        self.post("active antenna indication", move || {
            for listener in listeners {
                listener.on_active_antenna_change(index);
            }
        });
    }
}

fn dispatch_loop(shared: Arc<Shared>, events: Receiver<TransportEvent>) {
    // Ends once the transport worker exits and drops its sender
    for event in events.iter() {
        shared.handle_event(event);
    }
    tracing::debug!("antenna dispatcher stopped");
}

/// Client side of the simulated antenna service.
///
/// Every asynchronous request is tagged with a command id from the manager's
/// [`CommandCallbackManager`]; the id travels to the service as the request cookie
/// and is used to find the callback again once the response arrives.
pub struct AntennaManager {
    config: SharedConfig,
    shared: Arc<Shared>,
    transport: SimTransport,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl AntennaManager {
    /// Creates the manager and starts connecting to the service.
    /// Use [`AntennaManager::on_init_complete`] to learn when it is ready.
    pub fn new(config: SharedConfig) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(Shared::new());
        let (event_sender, event_receiver) = unbounded::<TransportEvent>();
        let transport = SimTransport::new(config.clone(), event_sender)?;

        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("antenna-dispatch".to_string())
            .spawn(move || dispatch_loop(dispatcher_shared, event_receiver))?;

        Ok(Arc::new(Self {
            config,
            shared,
            transport,
            dispatcher: Some(dispatcher),
        }))
    }

    pub fn get_service_status(&self) -> ServiceStatus {
        self.shared.lock_service().status
    }

    /// Queues `init_cb` to run once initialization completed, or right away if it already has
    pub fn on_init_complete(&self, init_cb: InitResponseCb) {
        let mut service = self.shared.lock_service();
        if service.init_done {
            let status = service.status;
            drop(service);
            self.shared.post("init callback", move || init_cb(status));
        } else {
            service.init_callbacks.push(init_cb);
        }
    }

    pub fn register_listener(&self, listener: Weak<dyn AntennaListener>) -> Status {
        self.shared.listeners.register_listener(listener)
    }

    pub fn deregister_listener(&self, listener: &Weak<dyn AntennaListener>) -> Status {
        self.shared.listeners.deregister_listener(listener)
    }

    /// Selects the active antenna. `callback`, if given, receives the result.
    pub fn set_active_antenna(&self, index: u8, callback: Option<ResponseCallback>) -> Status {
        let epoch = match self.check_ready() {
            Ok(epoch) => epoch,
            Err(status) => return status,
        };
        if index >= self.config.config().service.antenna_count {
            tracing::debug!("set_active_antenna: invalid index {}", index);
            return Status::InvalidParam;
        }

        let cmd_id = match callback {
            Some(cb) => self.shared.cmd_callbacks.register_strong(cb),
            None => INVALID_COMMAND_ID,
        };
        self.send(Request::SetActiveAntenna { index }, cmd_id, epoch)
    }

    /// Queries the active antenna, answering through a closure
    pub fn get_active_antenna(&self, callback: Option<GetActiveAntCb>) -> Status {
        let epoch = match self.check_ready() {
            Ok(epoch) => epoch,
            Err(status) => return status,
        };

        let cmd_id = match callback {
            Some(cb) => self.shared.cmd_callbacks.register_strong(cb),
            None => INVALID_COMMAND_ID,
        };
        self.send(Request::GetActiveAntenna, cmd_id, epoch)
    }

    /// Queries the active antenna, answering through an application-owned callback object
    pub fn request_active_antenna(&self, callback: Weak<dyn ActiveAntennaCallback>) -> Status {
        let epoch = match self.check_ready() {
            Ok(epoch) => epoch,
            Err(status) => return status,
        };
        if callback.strong_count() == 0 {
            return Status::InvalidParam;
        }

        let cmd_id = self.shared.cmd_callbacks.register_weak(callback);
        self.send(Request::GetActiveAntenna, cmd_id, epoch)
    }

    /// Simulates a subsystem restart of the antenna service
    pub fn inject_ssr(&self) -> Status {
        self.transport.inject_ssr()
    }

    /// Number of requests whose response callback has not run to completion yet.
    /// Zero means every callback result has been handed to the application.
    pub fn pending_commands(&self) -> usize {
        // Registry first: an entry leaves it only after it was counted as a delivery
        let registered = self.shared.cmd_callbacks.pending_count();
        registered + self.shared.deliveries.load(Ordering::SeqCst)
    }

    /// Returns the current restart epoch if the service accepts requests
    fn check_ready(&self) -> Result<u64, Status> {
        let service = self.shared.lock_service();
        match service.status {
            ServiceStatus::ServiceAvailable => Ok(service.epoch),
            status => {
                tracing::debug!("request refused, service {}", status);
                Err(Status::NotReady)
            }
        }
    }

    /// Hands the request to the transport unless the service restarted since `epoch`
    fn send(&self, request: Request, cmd_id: CommandId, epoch: u64) -> Status {
        // Held across the transport send so a restart cannot slip in between check and send
        let service = self.shared.lock_service();
        if service.epoch != epoch {
            drop(service);
            // The registry was reset under us; the id may already belong to a newer request
            tracing::debug!(cmd_id, "service restarted while issuing {:?}", request);
            return Status::NotReady;
        }

        if cmd_id != INVALID_COMMAND_ID {
            tracing::debug!(cmd_id, "-> {:?}", request);
        }
        let status = self.transport.send(request, cookie_from_cmd_id(cmd_id));

        // No response will ever carry this id. Taken back before a reset can hand it out again.
        let taken_back = if !status.is_success() && cmd_id != INVALID_COMMAND_ID {
            self.shared.cmd_callbacks.take(cmd_id)
        } else {
            None
        };
        drop(service);

        if taken_back.is_some() {
            tracing::debug!(cmd_id, "request not sent: {:?}", status);
        }
        status
    }
}

impl Drop for AntennaManager {
    fn drop(&mut self) {
        self.transport.shutdown();
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!("antenna manager dropped on its dispatcher, not joining");
            } else if handle.join().is_err() {
                tracing::error!("antenna dispatcher panicked");
            }
        }
        self.shared.task_queue.shutdown();
    }
}
