use clap::Parser;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use telux_config::{SharedConfig, toml_config};
use telux_core::{CommandCallback, ErrorCode, InitResponseCb, ServiceStatus, Status, debug};
use telux_sim::{ActiveAntennaCallback, AntennaListener, AntennaManager, GetActiveAntCb, SimFactory};

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> SharedConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "telux antenna service simulation",
    long_about = "Drives the simulated antenna service with a stream of asynchronous requests and reports how their callbacks were resolved"
)]
struct Args {
    /// Config file (required)
    #[arg(help = "TOML config with transport/service parameters")]
    config: String,

    /// Number of requests to issue
    #[arg(long, default_value_t = 12)]
    requests: u32,

    /// Inject a subsystem restart before issuing request K
    #[arg(long, value_name = "K")]
    ssr_after: Option<u32>,

    /// Give up waiting for the service or for responses after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

/// How a single request got resolved
#[derive(Debug)]
enum Outcome {
    Set(ErrorCode),
    Get(u8, ErrorCode),
}

/// Callback object for request_active_antenna, forwards to the result channel
struct ActiveAntennaReporter {
    results: Sender<Outcome>,
}

impl CommandCallback for ActiveAntennaReporter {}

impl ActiveAntennaCallback for ActiveAntennaReporter {
    fn on_active_antenna_response(&self, index: u8, error: ErrorCode) {
        let _ = self.results.send(Outcome::Get(index, error));
    }
}

struct AppListener;

impl AntennaListener for AppListener {
    fn on_active_antenna_change(&self, index: u8) {
        tracing::info!("active antenna is now {}", index);
    }

    fn on_service_status_change(&self, status: ServiceStatus) {
        tracing::info!("antenna service is {}", status);
    }
}

/// Blocks until `rx` yields the init result. None on timeout or Ctrl+C.
fn wait_for_init(rx: &Receiver<ServiceStatus>, running: &AtomicBool, deadline: Instant) -> Option<ServiceStatus> {
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(status) => return Some(status),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
    None
}

/// What became of an issued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Issued {
    /// A response callback is waiting
    Pending,
    /// Sent with a callback object that was released right away
    Abandoned,
    Refused,
}

/// Issues request `seq`, retrying while the service recovers
fn issue_request(
    mgr: &AntennaManager,
    seq: u32,
    antenna_count: u8,
    reporter: &Arc<ActiveAntennaReporter>,
    results: &Sender<Outcome>,
    running: &AtomicBool,
    deadline: Instant,
) -> Issued {
    let mut issued = Issued::Pending;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let status = match seq % 3 {
            0 => {
                let tx = results.clone();
                let index = (seq / 3 % antenna_count as u32) as u8;
                mgr.set_active_antenna(
                    index,
                    Some(Box::new(move |error: ErrorCode| {
                        let _ = tx.send(Outcome::Set(error));
                    })),
                )
            }
            1 => {
                let tx = results.clone();
                let cb: GetActiveAntCb = Box::new(move |index, error| {
                    let _ = tx.send(Outcome::Get(index, error));
                });
                mgr.get_active_antenna(Some(cb))
            }
            _ if seq % 6 == 5 => {
                // The application loses interest before the response arrives
                let short_lived = Arc::new(ActiveAntennaReporter { results: results.clone() });
                let weak: Weak<dyn ActiveAntennaCallback> = Arc::<ActiveAntennaReporter>::downgrade(&short_lived);
                let status = mgr.request_active_antenna(weak);
                drop(short_lived);
                issued = Issued::Abandoned;
                status
            }
            _ => {
                let weak: Weak<dyn ActiveAntennaCallback> = Arc::<ActiveAntennaReporter>::downgrade(reporter);
                mgr.request_active_antenna(weak)
            }
        };

        match status {
            Status::Success => return issued,
            Status::NotReady => thread::sleep(Duration::from_millis(20)),
            other => {
                tracing::warn!("request {} refused: {:?}", seq, other);
                return Issued::Refused;
            }
        }
    }
    Issued::Refused
}

fn main() {
    eprintln!("telux-sim-app: simulated antenna service client\n");

    let args = Args::parse();
    let cfg = load_config_from_toml(&args.config);
    let _log_guard = debug::setup_logging_default(cfg.config().debug_log.clone());

    // Set up Ctrl+C handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("failed to set Ctrl+C handler");

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let factory = SimFactory::new(cfg.clone());

    let (init_tx, init_rx) = unbounded();
    let init_cb: InitResponseCb = Box::new(move |status| {
        let _ = init_tx.send(status);
    });
    let Some(mgr) = factory.get_antenna_manager(Some(init_cb)) else {
        eprintln!("Failed to create antenna manager");
        std::process::exit(1);
    };

    match wait_for_init(&init_rx, &running, deadline) {
        Some(ServiceStatus::ServiceAvailable) => tracing::info!("antenna service ready"),
        Some(status) => {
            eprintln!("Antenna service initialization failed: {}", status);
            std::process::exit(1);
        }
        None => {
            eprintln!("Antenna service did not become available");
            std::process::exit(1);
        }
    }

    let listener: Arc<dyn AntennaListener> = Arc::new(AppListener);
    if mgr.register_listener(Arc::downgrade(&listener)) != Status::Success {
        tracing::warn!("failed to register antenna listener");
    }

    let (results_tx, results_rx) = unbounded::<Outcome>();
    let reporter = Arc::new(ActiveAntennaReporter { results: results_tx.clone() });
    let antenna_count = cfg.config().service.antenna_count;

    let mut issued = 0u32;
    let mut abandoned = 0u32;
    for seq in 0..args.requests {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if args.ssr_after == Some(seq) {
            tracing::info!("injecting SSR with {} commands pending", mgr.pending_commands());
            if mgr.inject_ssr() != Status::Success {
                tracing::warn!("SSR injection failed");
            }
        }
        match issue_request(&mgr, seq, antenna_count, &reporter, &results_tx, &running, deadline) {
            Issued::Pending => issued += 1,
            Issued::Abandoned => abandoned += 1,
            Issued::Refused => {}
        }
    }

    // Collect responses until everything is resolved. Callbacks dropped by an SSR never report.
    let mut succeeded = 0u32;
    let mut failed = 0u32;
    while running.load(Ordering::SeqCst) && succeeded + failed < issued && Instant::now() < deadline {
        match results_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(outcome) => {
                tracing::debug!("{:?}", outcome);
                let error = match outcome {
                    Outcome::Set(error) | Outcome::Get(_, error) => error,
                };
                if error.is_success() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // pending_commands() also counts responses still queued for their callback
                if mgr.pending_commands() == 0 && results_rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let lost = issued.saturating_sub(succeeded + failed);
    tracing::info!(
        "{} requests issued: {} succeeded, {} failed, {} without response, {} abandoned ({} SSRs, {} still pending)",
        issued + abandoned,
        succeeded,
        failed,
        lost,
        abandoned,
        cfg.state_read().ssr_count,
        mgr.pending_commands()
    );
    eprintln!(
        "issued {}, succeeded {}, failed {}, lost {}, abandoned {}",
        issued + abandoned,
        succeeded,
        failed,
        lost,
        abandoned
    );
}
