use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` wins when set;
/// otherwise per-tick noise stays at debug level.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,home_energy_replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
