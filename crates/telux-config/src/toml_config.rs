use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use super::sim_config::{CfgService, CfgTransport, SharedConfig, SimConfig, SimState};

pub const EXPECTED_CONFIG_VERSION: &str = "0.1";

/// Build `SharedConfig` from a TOML configuration string
pub fn from_toml_str(toml_str: &str) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    // Various sanity checks
    if !root.config_version.eq(EXPECTED_CONFIG_VERSION) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, EXPECTED_CONFIG_VERSION
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    if let Some(ref transport) = root.transport {
        if !transport.extra.is_empty() {
            return Err(format!("Unrecognized fields in transport: {:?}", sorted_keys(&transport.extra)).into());
        }
    }
    if let Some(ref service) = root.service {
        if !service.extra.is_empty() {
            return Err(format!("Unrecognized fields in service: {:?}", sorted_keys(&service.extra)).into());
        }
    }

    let mut cfg = SimConfig {
        debug_log: root.debug_log,
        transport: CfgTransport::default(),
        service: CfgService::default(),
    };

    if let Some(transport) = root.transport {
        apply_transport_patch(&mut cfg.transport, transport);
    }
    if let Some(service) = root.service {
        apply_service_patch(&mut cfg.service, service);
    }

    let state = SimState {
        active_antenna: cfg.service.default_antenna_index,
        ..SimState::default()
    };
    Ok(SharedConfig::from_parts(cfg, state)?)
}

/// Build `SharedConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `SharedConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SharedConfig, Box<dyn std::error::Error>> {
    let f = File::open(path)?;
    let r = BufReader::new(f);
    let cfg = from_reader(r)?;
    Ok(cfg)
}

fn apply_transport_patch(dst: &mut CfgTransport, src: TransportDto) {
    if let Some(v) = src.response_delay_ms {
        dst.response_delay_ms = v;
    }
    if let Some(v) = src.response_jitter_ms {
        dst.response_jitter_ms = v;
    }
    if let Some(v) = src.failure_rate {
        dst.failure_rate = v;
    }
}

fn apply_service_patch(dst: &mut CfgService, src: ServiceDto) {
    if let Some(v) = src.init_delay_ms {
        dst.init_delay_ms = v;
    }
    if let Some(v) = src.ssr_recovery_ms {
        dst.ssr_recovery_ms = v;
    }
    if let Some(v) = src.default_antenna_index {
        dst.default_antenna_index = v;
    }
    if let Some(v) = src.antenna_count {
        dst.antenna_count = v;
    }
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&str> {
    let mut v: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
    v.sort_unstable();
    v
}

/// ----------------------- DTOs for input shape -----------------------

#[derive(Deserialize)]
struct TomlConfigRoot {
    config_version: String,
    debug_log: Option<String>,

    #[serde(default)]
    transport: Option<TransportDto>,

    #[serde(default)]
    service: Option<ServiceDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct TransportDto {
    response_delay_ms: Option<u64>,
    response_jitter_ms: Option<u64>,
    failure_rate: Option<f64>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Default, Deserialize)]
struct ServiceDto {
    init_delay_ms: Option<u64>,
    ssr_recovery_ms: Option<u64>,
    default_antenna_index: Option<u8>,
    antenna_count: Option<u8>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}
