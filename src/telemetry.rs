//! Logging and metrics descriptions.
//! Counters go through the `metrics` facade, a recorder can be installed by
//! the embedding process.
use metrics::Unit;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the level.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Describe the counters updated by the service.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "warden_registrations_total",
        Unit::Count,
        "Accounts created, by registration method."
    );
    metrics::describe_counter!(
        "warden_logins_total",
        Unit::Count,
        "Password logins, by result."
    );
    metrics::describe_counter!(
        "warden_tokens_generated_total",
        Unit::Count,
        "One-time tokens issued, by type."
    );
    metrics::describe_counter!(
        "warden_tokens_verified_total",
        Unit::Count,
        "One-time tokens consumed."
    );
    metrics::describe_counter!(
        "warden_mails_sent_total",
        Unit::Count,
        "Token emails handed to the mail transport."
    );
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
