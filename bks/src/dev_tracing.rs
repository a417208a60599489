//! Development helper: initialize a tracing subscriber when `RUST_LOG` is set.
//!
//! Tests and benches call `bks::dev_tracing::init_tracing()` to see the
//! `[COORD]`, `[NEGOTIATE]`, `[WORKER]` and `[POOL]` logs. The library itself
//! never installs a subscriber.

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// A no-op when `RUST_LOG` is unset or a global subscriber already exists.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
