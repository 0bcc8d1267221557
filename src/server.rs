use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{watch, Semaphore},
};

use crate::{client::Client, protocol::MAX_REQUEST_SIZE, Shared};

/// The largest worker pool the server can drain on shutdown
pub const MAX_CONNECTIONS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Accepts client connections and serves each on its own task
///
/// at most `max_connections` clients are served at the same time,
/// further connections wait in the accept backlog until a worker frees up.
/// the pool size is clamped to `1..=MAX_CONNECTIONS`.
pub struct Server {
    listener: TcpListener,
    state: Shared,
    max_connections: usize,
}

impl Server {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        state: Shared,
        max_connections: usize,
    ) -> tokio::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            state,
            max_connections: max_connections.clamp(1, MAX_CONNECTIONS),
        })
    }

    pub fn local_addr(&self) -> tokio::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `shutdown` resolves
    ///
    /// on shutdown the server stops accepting, asks every active connection to close
    /// once its current request was answered, waits for all of them, and only then
    /// releases the listening socket.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let workers = Arc::new(Semaphore::new(self.max_connections));
        let (stop, stopped) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            // wait for a free worker before taking the next connection
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break, // the pool is never closed
                },
            };

            let (conn, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("failed to accept a connection: {}", err);
                        continue;
                    }
                },
            };

            let client = Client::new(self.state.clone());
            tracing::debug!("client {} connected from {}", client.id(), peer);

            let stopped = stopped.clone();
            tokio::spawn(async move {
                handle_connection(client, conn, stopped).await;
                drop(permit);
            });
        }

        tracing::info!("shutting down, waiting for active connections");
        stop.send_replace(true);

        // every worker returns its permit once its connection is closed
        let all_workers = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        let _ = workers.acquire_many(all_workers).await;
        drop(self.listener);

        tracing::info!("server stopped");
    }
}

async fn handle_connection(mut client: Client, mut stream: TcpStream, stop: watch::Receiver<bool>) {
    match serve(&mut client, &mut stream, stop).await {
        Ok(()) => tracing::debug!("client {} disconnected", client.id()),
        Err(err) => tracing::debug!("client {} dropped: {}", client.id(), err),
    }
    // the halves were released by `serve`, the socket goes last
    drop(stream);
}

// one response per request, in order, until EOF, an I/O error or shutdown
async fn serve(
    client: &mut Client,
    stream: &mut TcpStream,
    mut stop: watch::Receiver<bool>,
) -> tokio::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    loop {
        let stopping = *stop.borrow();
        if stopping {
            break;
        }

        let mut request = Vec::new();
        let rcount = tokio::select! {
            // a request that already arrived is still answered
            biased;
            rcount = read_limited_line(&mut reader, &mut request) => rcount?,
            _ = stop.changed() => break,
        };
        if rcount == 0 {
            break; // EOF
        }

        if request.iter().all(u8::is_ascii_whitespace) {
            // skip empty lines
            continue;
        }

        tracing::debug!("received: {}", String::from_utf8_lossy(&request).trim_end());
        let response = client.handle_request(&request);
        tracing::debug!("responded: {:?}", response);

        writer.write_all(response.encode().as_bytes()).await?;
        writer.flush().await?;
    }

    // locals drop in reverse order: the read half, then the write half
    Ok(())
}

// reads a line into `buf`, keeping at most one byte past `MAX_REQUEST_SIZE` of it.
// the rest of an oversized line is consumed and dropped.
// returns the number of bytes read from the socket, 0 on EOF
async fn read_limited_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> tokio::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_REQUEST_SIZE as u64 + 1;
    let mut rcount = (&mut *reader).take(limit).read_until(b'\n', buf).await?;

    if buf.len() > MAX_REQUEST_SIZE && !buf.ends_with(b"\n") {
        let mut skipped = Vec::new();
        loop {
            skipped.clear();
            let count = (&mut *reader).take(limit).read_until(b'\n', &mut skipped).await?;
            rcount += count;
            if count == 0 || skipped.ends_with(b"\n") {
                break;
            }
        }
    }

    Ok(rcount)
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use rust_decimal::Decimal;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{
            tcp::{OwnedReadHalf, OwnedWriteHalf},
            TcpStream,
        },
        sync::oneshot,
        task::JoinHandle,
    };

    use crate::{
        config::TicketPolicy,
        events::EventLog,
        ledger::Ledger,
        protocol::{Action, Request, Response, Status, MAX_REQUEST_SIZE},
        Shared, SharedState,
    };

    use super::Server;

    const PASSWORD: &str = "secret";

    pub struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        pub async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        pub async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        pub async fn read_line(&mut self) -> Option<String> {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await.unwrap() {
                0 => None,
                _ => Some(line),
            }
        }

        pub async fn request(&mut self, request: Request) -> Response {
            self.send_line(&request.encode()).await;
            let line = self.read_line().await.expect("server closed the connection");
            Response::decode(&line).unwrap()
        }
    }

    pub struct RunningServer {
        pub addr: SocketAddr,
        pub state: Shared,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    }

    impl RunningServer {
        pub async fn start(starting_balance: i64, max_connections: usize) -> Self {
            let state = Arc::new(SharedState::new(
                Ledger::new(Decimal::from(starting_balance)),
                PASSWORD.into(),
                TicketPolicy::default(),
            ));

            Self::with_state(state, max_connections).await
        }

        pub async fn with_state(state: Shared, max_connections: usize) -> Self {
            let server = Server::bind("127.0.0.1:0", state.clone(), max_connections)
                .await
                .unwrap();
            let addr = server.local_addr().unwrap();

            let (stop, stopped) = oneshot::channel();
            let handle = tokio::spawn(server.run(async {
                let _ = stopped.await;
            }));

            Self {
                addr,
                state,
                stop,
                handle,
            }
        }

        pub async fn shutdown(self) {
            let _ = self.stop.send(());
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("server should stop once asked to")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn buy_ticket_and_win() {
        let server = RunningServer::start(100, 8).await;
        let mut alice = TestClient::connect(server.addr).await;

        let response = alice
            .request(Request::new(Action::Login).with_username("alice"))
            .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.balance, Some(Decimal::from(100)));

        let response = alice
            .request(Request::new(Action::BuyTicket).with_username("alice"))
            .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.balance, Some(Decimal::from(90)));
        let ticket_id = response.ticket_id.unwrap();
        let numbers = response.ticket_numbers.unwrap();
        assert_eq!(numbers.len(), 5);
        assert_eq!(server.state.ledger.last_issued_ticket_id(), ticket_id);

        let mut admin = TestClient::connect(server.addr).await;
        let response = admin
            .request(Request::new(Action::AdminLogin).with_password(PASSWORD))
            .await;
        assert_eq!(response.status, Status::Success);
        let response = admin
            .request(Request::new(Action::SetWinningNumber).with_winning_number(numbers[4]))
            .await;
        assert_eq!(response.status, Status::Success);

        let response = alice
            .request(Request::new(Action::CheckResult).with_username("alice"))
            .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.won, Some(true));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_action_keeps_connection_open() {
        let server = RunningServer::start(100, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        client.send_line("{\"action\":\"foo\"}\n").await;
        let response = Response::decode(&client.read_line().await.unwrap()).unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response.message.contains("foo"));

        // garbage is answered too, and blank lines are skipped silently
        client.send_line("\n{ garbage\n").await;
        let response = Response::decode(&client.read_line().await.unwrap()).unwrap();
        assert_eq!(response.status, Status::Error);

        let response = client
            .request(Request::new(Action::Login).with_username("bob"))
            .await;
        assert_eq!(response.status, Status::Success);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_utf8_keeps_connection_open() {
        let server = RunningServer::start(100, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        client
            .writer
            .write_all(b"{\"action\":\"login\",\"username\":\"\xff\xfe\"}\n")
            .await
            .unwrap();
        let response = Response::decode(&client.read_line().await.unwrap()).unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response.message.starts_with("malformed message"));

        let response = client
            .request(Request::new(Action::Login).with_username("bob"))
            .await;
        assert_eq!(response.status, Status::Success);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_and_skipped() {
        let server = RunningServer::start(100, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        let mut line = "x".repeat(MAX_REQUEST_SIZE * 3);
        line.push('\n');
        client.send_line(&line).await;

        let response = Response::decode(&client.read_line().await.unwrap()).unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(response.message.starts_with("malformed message"));

        // the tail of the long line is not taken for a new request
        let response = client
            .request(Request::new(Action::Login).with_username("bob"))
            .await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.balance, Some(Decimal::from(100)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn insufficient_balance_over_the_wire() {
        let server = RunningServer::start(5, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        client
            .request(Request::new(Action::Login).with_username("carol"))
            .await;
        let response = client
            .request(Request::new(Action::BuyTicket).with_username("carol"))
            .await;

        assert_eq!(response.status, Status::Error);
        assert!(response.message.starts_with("insufficient balance"));
        assert_eq!(
            server.state.ledger.balance_of("carol").unwrap(),
            Decimal::from(5)
        );
        assert_eq!(server.state.ledger.ticket_count(), 0);
        assert_eq!(server.state.ledger.last_issued_ticket_id(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let server = RunningServer::start(100, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        let mut batch = Request::new(Action::Login).with_username("dave").encode();
        for _ in 0..3 {
            batch += &Request::new(Action::BuyTicket).with_username("dave").encode();
        }
        client.send_line(&batch).await;

        let mut balances = Vec::new();
        for _ in 0..4 {
            let response = Response::decode(&client.read_line().await.unwrap()).unwrap();
            balances.push(response.balance.unwrap());
        }

        let expected: Vec<Decimal> = [100, 90, 80, 70].into_iter().map(Decimal::from).collect();
        assert_eq!(balances, expected);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_clients_share_one_ledger() {
        let server = RunningServer::start(50, 16).await;

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let addr = server.addr;
                tokio::spawn(async move {
                    let mut client = TestClient::connect(addr).await;
                    client
                        .request(Request::new(Action::Login).with_username("shared"))
                        .await;
                    let mut bought = 0;
                    for _ in 0..3 {
                        let response = client
                            .request(Request::new(Action::BuyTicket).with_username("shared"))
                            .await;
                        if response.status == Status::Success {
                            bought += 1;
                        }
                    }
                    bought
                })
            })
            .collect();

        let mut bought = 0;
        for task in tasks {
            bought += task.await.unwrap();
        }

        assert_eq!(bought, 5);
        assert_eq!(
            server.state.ledger.balance_of("shared").unwrap(),
            Decimal::ZERO
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn saturated_pool_queues_connections() {
        let server = RunningServer::start(100, 1).await;

        let mut first = TestClient::connect(server.addr).await;
        let response = first
            .request(Request::new(Action::Login).with_username("first"))
            .await;
        assert_eq!(response.status, Status::Success);

        // the only worker is busy, the second client is connected but not served
        let mut second = TestClient::connect(server.addr).await;
        second
            .send_line(&Request::new(Action::Login).with_username("second").encode())
            .await;
        let pending = tokio::time::timeout(Duration::from_millis(200), second.read_line()).await;
        assert!(pending.is_err(), "second client should wait for a free worker");

        drop(first);

        let line = tokio::time::timeout(Duration::from_secs(5), second.read_line())
            .await
            .expect("second client should be served once the first left")
            .unwrap();
        assert_eq!(Response::decode(&line).unwrap().status, Status::Success);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() {
        let server = RunningServer::start(100, 8).await;
        let mut client = TestClient::connect(server.addr).await;
        client
            .request(Request::new(Action::Login).with_username("erin"))
            .await;

        let addr = server.addr;
        server.shutdown().await;

        // the server side closed the connection
        assert_eq!(client.read_line().await, None);
        // and no longer accepts new ones
        assert!(TcpStream::connect(addr).await.is_err());
    }

    // holds the first request that logs an event until the test releases it
    struct GatedEventLog {
        entered: mpsc::SyncSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl EventLog for GatedEventLog {
        fn log(&self, _event: &str) {
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_answers_the_request_in_progress() {
        let (entered_tx, entered) = mpsc::sync_channel(1);
        let (release, release_rx) = mpsc::sync_channel(1);
        let state = Arc::new(
            SharedState::new(
                Ledger::new(Decimal::from(100)),
                PASSWORD.into(),
                TicketPolicy::default(),
            )
            .with_event_log(Arc::new(GatedEventLog {
                entered: entered_tx,
                release: Mutex::new(release_rx),
            })),
        );
        let server = RunningServer::with_state(state, 8).await;
        let mut client = TestClient::connect(server.addr).await;

        client
            .send_line(&Request::new(Action::Login).with_username("frank").encode())
            .await;
        // the handler has read the request and is still working on it
        tokio::task::spawn_blocking(move || entered.recv())
            .await
            .unwrap()
            .unwrap();

        let shutdown = tokio::spawn(server.shutdown());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shutdown.is_finished(), "shutdown should wait for the busy worker");
        release.send(()).unwrap();

        let line = client
            .read_line()
            .await
            .expect("the request in progress should be answered");
        assert_eq!(Response::decode(&line).unwrap().status, Status::Success);
        assert_eq!(client.read_line().await, None);

        shutdown.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_pools_are_clamped() {
        let server = RunningServer::start(100, usize::MAX).await;
        let mut client = TestClient::connect(server.addr).await;
        let response = client
            .request(Request::new(Action::Login).with_username("gina"))
            .await;
        assert_eq!(response.status, Status::Success);
        drop(client);

        server.shutdown().await;
    }
}
