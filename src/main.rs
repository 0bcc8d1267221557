use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lottery_server::{
    config::{Args, Config},
    events::FileEventLog,
    feed::EventFeed,
    ledger::Ledger,
    logging,
    server::Server,
    SharedState,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    let config = Config::try_from(args).context("invalid configuration")?;

    let mut state = SharedState::new(
        Ledger::new(config.starting_balance),
        config.admin_password.clone(),
        config.policy.clone(),
    );
    if let Some(path) = &config.event_log {
        let event_log = FileEventLog::open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        state = state.with_event_log(Arc::new(event_log));
    }
    let state = Arc::new(state);

    let server = Server::bind(config.listen, state.clone(), config.max_connections)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!("Server listening on: {}", server.local_addr()?);

    let (stop, stopped) = watch::channel(false);

    let feed = match config.events_listen {
        Some(addr) => {
            let feed = EventFeed::bind(addr, state.clone())
                .await
                .with_context(|| format!("failed to bind event feed {}", addr))?;
            tracing::info!("Event feed listening on: {}", feed.local_addr()?);
            Some(tokio::spawn(feed.run(wait_for_stop(stopped.clone()))))
        }
        None => None,
    };

    server
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                // without a signal there is nothing to stop on, keep serving
                tracing::error!("failed to listen for ctrl-c: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await;

    stop.send_replace(true);
    if let Some(feed) = feed {
        feed.await?;
    }
    state.broadcaster.close_all();

    Ok(())
}

async fn wait_for_stop(mut stopped: watch::Receiver<bool>) {
    loop {
        let stopping = *stopped.borrow();
        if stopping || stopped.changed().await.is_err() {
            return;
        }
    }
}
