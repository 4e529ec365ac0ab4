pub mod monitor;

pub use monitor::{run_signal_scan, SignalThresholds, TOP_SYMBOLS_LIMIT};
