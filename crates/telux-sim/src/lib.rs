//! Simulated telux services
//!
//! This crate provides:
//! - A simulated transport with configurable latency, failures and subsystem restarts
//! - The antenna manager, correlating its requests and responses through command ids
//! - A factory handing out (and caching) service managers

pub mod antenna;
pub mod factory;
pub mod transport;

pub use antenna::{ActiveAntennaCallback, AntennaListener, AntennaManager, GetActiveAntCb};
pub use factory::SimFactory;
