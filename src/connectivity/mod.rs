//! Connectivity Module
//!
//! - `monitor.rs`: debounced online/offline state and its subscribers
//! - `probe.rs`: periodic reachability probe feeding the monitor

pub mod monitor;
pub mod probe;

pub use monitor::{Connectivity, ConnectivityMonitor};
pub use probe::NetworkProbe;
