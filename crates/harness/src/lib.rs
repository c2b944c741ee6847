//! Test support: an in-memory remote authority, client sessions and demo
//! schemas for driving leaders end to end.

pub mod schemas;
pub mod server;
pub mod session;

pub use server::{MemoryBackend, MemoryServer};
pub use session::{TestClient, TestSession, test_config};

/// Installs a test-friendly tracing subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
