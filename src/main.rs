use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tokio::sync::watch;
use warden::mail::Dispatcher;
use warden::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::setup_logging();
    telemetry::describe_metrics();

    let state = warden::initialize_state().await?;
    let (shutdown, signal) = watch::channel(false);

    let mut tasks = vec![state.openid.states().spawn_sweeper(signal.clone())];
    if let Some(mail) = &state.config.mail {
        let dispatcher = Dispatcher::from_config(mail, state.tokens.clone()).await?;
        tasks.push(dispatcher.spawn(mail.interval(), signal));
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, state.config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        name = %state.config.name,
        version = %state.config.version(),
        providers = ?state.openid.providers(),
        "server started"
    );

    axum::serve(listener, warden::app(state))
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    // Stop background tasks once in-flight requests are done.
    shutdown.send_replace(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "background task panicked");
        }
    }
    tracing::info!("server stopped");

    Ok(())
}
