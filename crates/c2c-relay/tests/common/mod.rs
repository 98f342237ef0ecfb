//! Common test utilities.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use c2c_protocol::{Command, Message, SERVER_ID, decode_frame, encode_frame};
use c2c_relay::config::RelayConfig;
use c2c_relay::middleware::SessionFactory;
use c2c_relay::server::RelayServer;
use c2c_relay::session::ConnectionCache;
use c2c_relay::store::{MessageQueue, RelayStorage};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A relay listening on an ephemeral local port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: ConnectionCache,
    pub storage: RelayStorage,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<std::io::Result<()>>,
}

pub async fn start_relay(relay: RelayConfig) -> TestRelay {
    let storage = RelayStorage::in_memory();
    let registry = ConnectionCache::new();
    let factory = SessionFactory::new(&relay, registry.clone(), storage.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(factory, Duration::from_millis(100));
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(async move { server.serve(listener).await });

    TestRelay {
        addr,
        registry,
        storage,
        shutdown,
        task,
    }
}

/// Wait until `name` is no longer online.
pub async fn wait_offline(registry: &ConnectionCache, name: &str) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while registry.resolve_name(name).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client still online");
}

/// Wait until everything stored for `id` has been acknowledged.
pub async fn wait_drained(storage: &RelayStorage, id: u64) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while storage.queue.get_next(id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stored messages were not acknowledged");
}

/// Line-oriented client speaking the relay protocol.
pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        let line = encode_frame(msg).unwrap();
        self.send_raw(&line).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        decode_frame(&line).unwrap()
    }

    /// True when the server closes the connection within the timeout.
    pub async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    /// Identify by name and return the assigned client ID.
    pub async fn init(&mut self, name: &str) -> u64 {
        self.send(&Message::new(Command::InitByName, name, SERVER_ID, [name, SERVER_ID]))
            .await;
        let ack = self.recv().await;
        assert_eq!(ack.command, Command::InitByName, "unexpected reply {ack:?}");
        assert_eq!(ack.content[1], name);
        ack.content[0].parse().unwrap()
    }
}
