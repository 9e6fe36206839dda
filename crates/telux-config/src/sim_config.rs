use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use telux_core::ServiceStatus;

/// Behaviour of the simulated transport between the SDK and the service
#[derive(Debug, Clone)]
pub struct CfgTransport {
    /// Base latency applied to every response
    pub response_delay_ms: u64,
    /// Random extra latency in 0..=jitter. Non-zero jitter reorders responses.
    pub response_jitter_ms: u64,
    /// Probability in [0, 1] that a response carries GenericFailure
    pub failure_rate: f64,
}

impl Default for CfgTransport {
    fn default() -> Self {
        Self {
            response_delay_ms: default_response_delay_ms(),
            response_jitter_ms: 0,
            failure_rate: 0.0,
        }
    }
}

/// Behaviour of the simulated service itself
#[derive(Debug, Clone)]
pub struct CfgService {
    /// Time from manager creation until the service reports available
    pub init_delay_ms: u64,
    /// How long the service stays unavailable after a subsystem restart
    pub ssr_recovery_ms: u64,
    pub default_antenna_index: u8,
    pub antenna_count: u8,
}

impl Default for CfgService {
    fn default() -> Self {
        Self {
            init_delay_ms: default_init_delay_ms(),
            ssr_recovery_ms: default_ssr_recovery_ms(),
            default_antenna_index: 0,
            antenna_count: default_antenna_count(),
        }
    }
}

#[inline]
fn default_response_delay_ms() -> u64 {
    20
}

#[inline]
fn default_init_delay_ms() -> u64 {
    50
}

#[inline]
fn default_ssr_recovery_ms() -> u64 {
    200
}

#[inline]
fn default_antenna_count() -> u8 {
    2
}

#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Optional verbose log file
    pub debug_log: Option<String>,
    pub transport: CfgTransport,
    pub service: CfgService,
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate that all configuration fields hold sensible values.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(0.0..=1.0).contains(&self.transport.failure_rate) {
            return Err("transport.failure_rate must be within [0, 1]");
        }
        if self.service.antenna_count == 0 {
            return Err("service.antenna_count must be at least 1");
        }
        if self.service.default_antenna_index >= self.service.antenna_count {
            return Err("service.default_antenna_index must be below service.antenna_count");
        }
        Ok(())
    }
}

/// Mutable, simulation-editable state (lock-protected).
#[derive(Debug, Clone)]
pub struct SimState {
    pub service_status: ServiceStatus,
    pub active_antenna: u8,
    /// Number of subsystem restarts since startup
    pub ssr_count: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            service_status: ServiceStatus::ServiceUnavailable,
            active_antenna: 0,
            ssr_count: 0,
        }
    }
}

/// Global shared configuration: immutable config + mutable state.
#[derive(Clone)]
pub struct SharedConfig {
    /// Read-only configuration (immutable after construction).
    cfg: Arc<SimConfig>,
    /// Mutable state guarded with RwLock (written by the simulation, read by others).
    state: Arc<RwLock<SimState>>,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedConfig {
    /// Default configuration, always valid
    pub fn new() -> Self {
        let cfg = SimConfig::new();
        let state = SimState {
            active_antenna: cfg.service.default_antenna_index,
            ..SimState::default()
        };
        Self::build(cfg, state)
    }

    pub fn from_config(cfg: SimConfig) -> Result<Self, &'static str> {
        let state = SimState {
            active_antenna: cfg.service.default_antenna_index,
            ..SimState::default()
        };
        Self::from_parts(cfg, state)
    }

    pub fn from_parts(cfg: SimConfig, state: SimState) -> Result<Self, &'static str> {
        // Check config for validity before returning the SharedConfig object
        cfg.validate()?;
        Ok(Self::build(cfg, state))
    }

    fn build(cfg: SimConfig, state: SimState) -> Self {
        Self {
            cfg: Arc::new(cfg),
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Access immutable config.
    pub fn config(&self) -> Arc<SimConfig> {
        Arc::clone(&self.cfg)
    }

    /// Read guard for mutable state.
    pub fn state_read(&self) -> RwLockReadGuard<'_, SimState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write guard for mutable state.
    pub fn state_write(&self) -> RwLockWriteGuard<'_, SimState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
