//! Process-wide tracing setup shared by the relay binary, benches and tests.

pub mod subscriber;

pub use subscriber::LogFormat;

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(LogFormat::Json, "info");
}
