//! JSON Lines TCP transport.
//!
//! One task per connection: the connection task decodes lines and feeds them
//! to `write`, while a spawned reader task runs the session's read loop and
//! writes outbound frames. Failed commands are answered with an `error`
//! message carrying the numeric code.

use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use c2c_protocol::{Message, decode_frame, encode_frame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::middleware::SessionFactory;
use crate::session::{ClientSession, ReadEvent, ReadHandler};

// ============================================================================
// Server
// ============================================================================

pub struct RelayServer {
    factory: SessionFactory,
    read_timeout: Duration,
    next_session: AtomicU32,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(factory: SessionFactory, read_timeout: Duration) -> Self {
        Self {
            factory,
            read_timeout,
            next_session: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then wait for them to finish.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "Relay listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
                        let connection = Connection {
                            session: self.factory.create(session_id),
                            session_id,
                            peer,
                            read_timeout: self.read_timeout,
                            shutdown: self.shutdown.clone(),
                        };
                        connections.spawn(connection.run(stream));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "Shutting down, closing connections");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    session: Arc<dyn ClientSession>,
    session_id: u32,
    peer: SocketAddr,
    read_timeout: Duration,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        info!(session_id = self.session_id, peer = %self.peer, "Connection accepted");
        let (read_half, write_half) = stream.into_split();
        let writer = FrameWriter::new(write_half);

        let mut reader = {
            let session = self.session.clone();
            let read_timeout = self.read_timeout;
            let mut sink = SocketSink {
                writer: writer.clone(),
                session_id: self.session_id,
            };
            tokio::spawn(async move {
                session.read(read_timeout, &mut sink).await;
            })
        };

        let mut lines = BufReader::new(read_half).lines();
        let mut reader_done = false;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut reader => {
                    // Nothing drains the inbound queue once the read loop ends
                    debug!(session_id = self.session_id, "Read loop ended, dropping connection");
                    reader_done = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = self.dispatch(&line).await
                            && let Err(write_err) = writer.send(&e.to_message(self.reply_to())).await
                        {
                            debug!(session_id = self.session_id, error = %write_err, "Failed to report error");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(session_id = self.session_id, "Peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(session_id = self.session_id, error = %e, "Error reading from peer");
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.session.close().await {
            warn!(session_id = self.session_id, error = %e, "Failed to close session");
        }
        if !reader_done {
            let _ = reader.await;
        }
        info!(session_id = self.session_id, peer = %self.peer, "Connection closed");
    }

    async fn dispatch(&self, line: &str) -> Result<(), RelayError> {
        let msg = decode_frame(line)?;
        let result = self.session.write(msg).await;
        if let Err(e) = &result {
            debug!(
                session_id = self.session_id,
                code = e.kind().code(),
                error = %e,
                "Command rejected"
            );
        }
        result
    }

    fn reply_to(&self) -> String {
        match self.session.id() {
            0 => String::new(),
            id => id.to_string(),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

#[derive(Clone)]
struct FrameWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(half)),
        }
    }

    async fn send(&self, msg: &Message) -> io::Result<()> {
        let line = encode_frame(msg).map_err(io::Error::other)?;
        let mut half = self.inner.lock().await;
        half.write_all(line.as_bytes()).await?;
        half.flush().await
    }
}

struct SocketSink {
    writer: FrameWriter,
    session_id: u32,
}

#[async_trait]
impl ReadHandler for SocketSink {
    async fn handle(&mut self, event: ReadEvent) -> ControlFlow<()> {
        match event {
            ReadEvent::Message(msg) => match self.writer.send(&msg).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    debug!(session_id = self.session_id, error = %e, "Failed to write to peer");
                    ControlFlow::Break(())
                }
            },
            ReadEvent::Timeout(_) => ControlFlow::Continue(()),
            ReadEvent::Eof => ControlFlow::Break(()),
        }
    }
}
