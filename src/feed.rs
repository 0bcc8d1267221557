use std::{future::Future, net::SocketAddr};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::watch,
    task::JoinSet,
};

use crate::{broadcast::Subscription, Shared};

/// Streams ledger events to connected viewers, one JSON event per line
///
/// viewers only listen, anything they send is ignored.
pub struct EventFeed {
    listener: TcpListener,
    state: Shared,
}

impl EventFeed {
    pub async fn bind(addr: impl ToSocketAddrs, state: Shared) -> tokio::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> tokio::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves viewers until `shutdown` resolves, then disconnects all of them
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let (stop, stopped) = watch::channel(false);
        let mut viewers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let (conn, peer) = tokio::select! {
                _ = &mut shutdown => break,
                // reap viewers that already left
                Some(_) = viewers.join_next(), if !viewers.is_empty() => continue,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("failed to accept a viewer: {}", err);
                        continue;
                    }
                },
            };

            let subscription = self.state.broadcaster.subscribe();
            tracing::debug!("viewer {} connected from {}", subscription.id(), peer);

            let state = self.state.clone();
            let stopped = stopped.clone();
            viewers.spawn(async move {
                let id = subscription.id();
                if let Err(err) = forward_events(conn, subscription, stopped).await {
                    tracing::debug!("viewer {} dropped: {}", id, err);
                }
                state.broadcaster.unsubscribe(id);
            });
        }

        stop.send_replace(true);
        while viewers.join_next().await.is_some() {}
    }
}

async fn forward_events(
    mut conn: TcpStream,
    mut subscription: Subscription,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (mut reader, writer) = conn.split();
    let mut writer = BufWriter::new(writer);
    let mut discard = [0u8; 512];

    loop {
        let event = tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break, // removed from the registry
            },
            _ = stop.changed() => break,
            // only used to notice the viewer hanging up
            read = reader.read(&mut discard) => match read? {
                0 => break,
                _ => continue,
            },
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
