//! `redshow` — an offline/online analysis engine for GPU memory-access
//! traces.
//!
//! The crate is a passive library: an embedding GPU runtime drives it
//! through [`Engine`], registering cubins and memory objects, handing over
//! trace buffers to analyze, and pulling aggregated results at `flush`.
//! The engine itself never spawns threads or blocks on I/O outside of
//! `flush`.

pub mod analysis;
pub mod binary;
pub mod config;
mod engine;
pub mod error;
pub mod interval;
pub mod memory;
pub mod metrics;
pub mod operation;
pub mod registry;
pub mod types;

pub use config::{AnalysisType, Config};
pub use engine::Engine;
pub use error::{RedshowError, Result};
pub use metrics::Metrics;

/// Installs `env_logger` as the `log` backend from `RUST_LOG`, mirroring
/// `cognitod`'s `main.rs` (`env_logger::init()`). An embedding runtime that
/// already installed its own `log` backend should skip this; it is a
/// convenience for runtimes that have none. A no-op if a backend is
/// already installed.
pub fn init_logger() {
    let _ = env_logger::try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_logger_is_idempotent() {
        super::init_logger();
        super::init_logger();
    }
}
