// src/logging.rs

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "rabbitmq_rpc=info";

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `rabbitmq_rpc=info`. Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
        tracing::info!("still logging");
    }
}
