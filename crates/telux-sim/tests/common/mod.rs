#![allow(dead_code)]

pub mod recorder;
pub mod sim_test;

pub use recorder::{Observed, Recorder};
pub use sim_test::{WAIT, fast_test_config, start_manager, wait_until};
