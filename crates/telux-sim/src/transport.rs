//! Simulated transport between the SDK managers and the (simulated) service
//!
//! Requests are handed to a worker thread together with a pointer-sized cookie.
//! The worker answers each request after the configured latency, echoing the
//! cookie, and emits service status changes for initialization and subsystem
//! restarts. Responses are not guaranteed to arrive in request order.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use telux_config::SharedConfig;
use telux_core::{CommandId, ErrorCode, INVALID_COMMAND_ID, ServiceStatus, Status};

/// Opaque, pointer-sized token travelling with a request. Zero means no id was supplied.
pub type Cookie = usize;

pub const NO_COOKIE: Cookie = 0;

/// How long the worker sleeps when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub fn cookie_from_cmd_id(cmd_id: CommandId) -> Cookie {
    if cmd_id <= 0 { NO_COOKIE } else { cmd_id as Cookie }
}

pub fn cmd_id_from_cookie(cookie: Cookie) -> CommandId {
    if cookie == NO_COOKIE {
        return INVALID_COMMAND_ID;
    }
    CommandId::try_from(cookie).unwrap_or(INVALID_COMMAND_ID)
}

/// Requests understood by the simulated antenna service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SetActiveAntenna { index: u8 },
    GetActiveAntenna,
}

/// Request-specific content of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseData {
    SetActiveAntenna,
    ActiveAntenna(u8),
}

/// Events the transport worker sends to the manager
#[derive(Debug)]
pub enum TransportEvent {
    /// Service availability changed
    ServiceStatus(ServiceStatus),

    /// Response to an earlier request, carrying the request's cookie
    Response { cookie: Cookie, error: ErrorCode, data: ResponseData },

    /// Unsolicited indication: the active antenna changed
    ActiveAntennaChanged(u8),
}

/// Commands the manager sends to the worker
#[derive(Debug)]
enum TransportCommand {
    Request { request: Request, cookie: Cookie },

    /// Simulate a subsystem restart
    InjectSsr,

    Shutdown,
}

pub struct SimTransport {
    config: SharedConfig,
    command_sender: Sender<TransportCommand>,
    worker_handle: Option<thread::JoinHandle<()>>,
}

impl SimTransport {
    /// Spawns the transport worker. Events are delivered on `event_sender`; the
    /// sender is dropped when the worker exits.
    pub fn new(config: SharedConfig, event_sender: Sender<TransportEvent>) -> std::io::Result<Self> {
        let (command_sender, command_receiver) = unbounded::<TransportCommand>();

        // A previous transport may have left the service marked available
        config.state_write().service_status = ServiceStatus::ServiceUnavailable;

        let worker_config = config.clone();
        let handle = thread::Builder::new().name("sim-transport".to_string()).spawn(move || {
            let mut worker = TransportWorker::new(worker_config, event_sender, command_receiver);
            worker.run();
        })?;

        Ok(Self {
            config,
            command_sender,
            worker_handle: Some(handle),
        })
    }

    /// Hands a request to the service. The response will carry `cookie`.
    pub fn send(&self, request: Request, cookie: Cookie) -> Status {
        if self.config.state_read().service_status != ServiceStatus::ServiceAvailable {
            tracing::debug!("send: service not available, rejecting {:?}", request);
            return Status::NotReady;
        }

        tracing::debug!("-> {:?} cookie {}", request, cookie);
        match self.command_sender.send(TransportCommand::Request { request, cookie }) {
            Ok(()) => Status::Success,
            Err(_) => {
                tracing::error!("send: transport worker is gone");
                Status::ConnectionLost
            }
        }
    }

    /// Simulates a subsystem restart: in-flight requests are lost, the service goes
    /// unavailable and recovers after the configured time.
    pub fn inject_ssr(&self) -> Status {
        match self.command_sender.send(TransportCommand::InjectSsr) {
            Ok(()) => Status::Success,
            Err(_) => Status::ConnectionLost,
        }
    }

    /// Stops the worker thread. Called on drop.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.worker_handle.take() else {
            return;
        };
        let _ = self.command_sender.send(TransportCommand::Shutdown);
        if handle.join().is_err() {
            tracing::error!("transport worker panicked");
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A request waiting for its simulated latency to pass
#[derive(Debug)]
struct InFlight {
    due: Instant,
    cookie: Cookie,
    request: Request,
}

struct TransportWorker {
    config: SharedConfig,
    event_sender: Sender<TransportEvent>,
    command_receiver: Receiver<TransportCommand>,
    in_flight: Vec<InFlight>,
    /// Scheduled service status change (initialization, SSR recovery)
    status_change: Option<(Instant, ServiceStatus)>,
}

impl TransportWorker {
    fn new(config: SharedConfig, event_sender: Sender<TransportEvent>, command_receiver: Receiver<TransportCommand>) -> Self {
        Self {
            config,
            event_sender,
            command_receiver,
            in_flight: Vec::new(),
            status_change: None,
        }
    }

    fn run(&mut self) {
        let init_delay = Duration::from_millis(self.config.config().service.init_delay_ms);
        self.status_change = Some((Instant::now() + init_delay, ServiceStatus::ServiceAvailable));

        loop {
            let timeout = match self.next_due() {
                Some(due) => due.saturating_duration_since(Instant::now()),
                None => IDLE_WAIT,
            };

            match self.command_receiver.recv_timeout(timeout) {
                Ok(TransportCommand::Request { request, cookie }) => self.enqueue(request, cookie),
                Ok(TransportCommand::InjectSsr) => self.handle_ssr(),
                Ok(TransportCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if !self.process_due() {
                tracing::debug!("event receiver gone, stopping transport worker");
                break;
            }
        }
        tracing::debug!("transport worker stopped, {} requests unanswered", self.in_flight.len());
    }

    fn next_due(&self) -> Option<Instant> {
        let next_response = self.in_flight.iter().map(|f| f.due).min();
        let next_status = self.status_change.map(|(due, _)| due);
        match (next_response, next_status) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.event_sender.send(event).is_ok()
    }

    fn enqueue(&mut self, request: Request, cookie: Cookie) {
        // The service went down after the manager checked; answer right away
        if self.config.state_read().service_status != ServiceStatus::ServiceAvailable {
            tracing::debug!("{:?} cookie {} while unavailable", request, cookie);
            let data = match request {
                Request::SetActiveAntenna { .. } => ResponseData::SetActiveAntenna,
                Request::GetActiveAntenna => ResponseData::ActiveAntenna(self.config.state_read().active_antenna),
            };
            self.emit(TransportEvent::Response { cookie, error: ErrorCode::SubsystemUnavailable, data });
            return;
        }

        let transport = &self.config.config().transport;
        let jitter = if transport.response_jitter_ms > 0 {
            rand::random_range(0..=transport.response_jitter_ms)
        } else {
            0
        };
        let latency = Duration::from_millis(transport.response_delay_ms + jitter);
        self.in_flight.push(InFlight {
            due: Instant::now() + latency,
            cookie,
            request,
        });
    }

    fn handle_ssr(&mut self) {
        let recovery = Duration::from_millis(self.config.config().service.ssr_recovery_ms);
        {
            let mut state = self.config.state_write();
            state.service_status = ServiceStatus::ServiceUnavailable;
            state.ssr_count += 1;
        }
        tracing::info!("SSR injected, discarding {} in-flight requests", self.in_flight.len());
        self.in_flight.clear();
        self.status_change = Some((Instant::now() + recovery, ServiceStatus::ServiceAvailable));
        self.emit(TransportEvent::ServiceStatus(ServiceStatus::ServiceUnavailable));
    }

    /// Emits everything that is due. Returns false once nobody listens anymore.
    fn process_due(&mut self) -> bool {
        let now = Instant::now();

        if let Some((due, status)) = self.status_change {
            if due <= now {
                self.status_change = None;
                self.config.state_write().service_status = status;
                tracing::info!("service {}", status);
                if !self.emit(TransportEvent::ServiceStatus(status)) {
                    return false;
                }
            }
        }

        let (mut due, pending): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|f| f.due <= now);
        self.in_flight = pending;
        due.sort_by_key(|f| f.due);

        for item in due {
            for event in self.respond(item.request, item.cookie) {
                if !self.emit(event) {
                    return false;
                }
            }
        }
        true
    }

    /// Executes a request against the simulated state
    fn respond(&self, request: Request, cookie: Cookie) -> Vec<TransportEvent> {
        let cfg = self.config.config();
        let failure_rate = cfg.transport.failure_rate;
        let failed = failure_rate > 0.0 && rand::random_bool(failure_rate);
        let mut events = Vec::with_capacity(2);

        match request {
            Request::SetActiveAntenna { index } => {
                let error = if failed {
                    ErrorCode::GenericFailure
                } else if index >= cfg.service.antenna_count {
                    ErrorCode::InvalidArguments
                } else {
                    ErrorCode::Success
                };

                let mut changed = false;
                if error.is_success() {
                    let mut state = self.config.state_write();
                    changed = state.active_antenna != index;
                    state.active_antenna = index;
                }

                events.push(TransportEvent::Response { cookie, error, data: ResponseData::SetActiveAntenna });
                if changed {
                    events.push(TransportEvent::ActiveAntennaChanged(index));
                }
            }
            Request::GetActiveAntenna => {
                let error = if failed { ErrorCode::GenericFailure } else { ErrorCode::Success };
                let index = self.config.state_read().active_antenna;
                events.push(TransportEvent::Response { cookie, error, data: ResponseData::ActiveAntenna(index) });
            }
        }
        events
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use telux_config::{CfgService, CfgTransport, SimConfig};
    use telux_core::debug;

    fn fast_config(jitter_ms: u64) -> SharedConfig {
        let cfg = SimConfig {
            debug_log: None,
            transport: CfgTransport {
                response_delay_ms: 1,
                response_jitter_ms: jitter_ms,
                failure_rate: 0.0,
            },
            service: CfgService {
                init_delay_ms: 30,
                ssr_recovery_ms: 5,
                default_antenna_index: 0,
                antenna_count: 2,
            },
        };
        SharedConfig::from_config(cfg).expect("valid test config")
    }

    fn recv(rx: &Receiver<TransportEvent>) -> TransportEvent {
        rx.recv_timeout(Duration::from_secs(5)).expect("transport event")
    }

    #[test]
    fn test_cookie_round_trip() {
        assert_eq!(cookie_from_cmd_id(INVALID_COMMAND_ID), NO_COOKIE);
        assert_eq!(cookie_from_cmd_id(0), NO_COOKIE);
        assert_eq!(cmd_id_from_cookie(NO_COOKIE), INVALID_COMMAND_ID);
        assert_eq!(cmd_id_from_cookie(cookie_from_cmd_id(77)), 77);
        assert_eq!(cmd_id_from_cookie(usize::MAX), INVALID_COMMAND_ID);
    }

    #[test]
    fn test_requests_answered_with_cookie() {
        debug::setup_logging_verbose();
        let (tx, rx) = unbounded();
        let transport = SimTransport::new(fast_config(0), tx).expect("spawn transport");

        assert_eq!(transport.send(Request::GetActiveAntenna, 3), Status::NotReady);
        assert!(matches!(recv(&rx), TransportEvent::ServiceStatus(ServiceStatus::ServiceAvailable)));

        assert_eq!(transport.send(Request::SetActiveAntenna { index: 1 }, 3), Status::Success);
        match recv(&rx) {
            TransportEvent::Response { cookie, error, data } => {
                assert_eq!(cookie, 3);
                assert_eq!(error, ErrorCode::Success);
                assert_eq!(data, ResponseData::SetActiveAntenna);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(recv(&rx), TransportEvent::ActiveAntennaChanged(1)));

        assert_eq!(transport.send(Request::SetActiveAntenna { index: 9 }, 4), Status::Success);
        assert!(matches!(
            recv(&rx),
            TransportEvent::Response { cookie: 4, error: ErrorCode::InvalidArguments, .. }
        ));
    }

    #[test]
    fn test_ssr_discards_in_flight_and_recovers() {
        debug::setup_logging_verbose();
        let mut cfg = fast_config(0);
        let mut sim_cfg = (*cfg.config()).clone();
        sim_cfg.transport.response_delay_ms = 200;
        cfg = SharedConfig::from_config(sim_cfg).expect("valid test config");

        let (tx, rx) = unbounded();
        let transport = SimTransport::new(cfg.clone(), tx).expect("spawn transport");
        assert!(matches!(recv(&rx), TransportEvent::ServiceStatus(ServiceStatus::ServiceAvailable)));

        assert_eq!(transport.send(Request::GetActiveAntenna, 1), Status::Success);
        assert_eq!(transport.inject_ssr(), Status::Success);

        assert!(matches!(recv(&rx), TransportEvent::ServiceStatus(ServiceStatus::ServiceUnavailable)));
        assert!(matches!(recv(&rx), TransportEvent::ServiceStatus(ServiceStatus::ServiceAvailable)));
        assert_eq!(cfg.state_read().ssr_count, 1);

        // The request issued before the restart is never answered
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
