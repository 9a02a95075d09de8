//! Tokio driver.
//!
//! Runs a [`WebSocketEngine`] over any `AsyncRead + AsyncWrite` stream on which the opening
//! handshake already completed. The [`Transport`] and [`Reactor`] handed to the engine are
//! channels into the driver loop, which owns the stream and turns timer expirations into
//! [`WebSocketEngine::timer_fired`] calls, so the engine is only ever touched by one task.
//!
//! ```rust,no_run
//! use tokio::net::TcpListener;
//! use wsengine::{native, ConnectionRequest, Connection, Handler, Handshake, Message, Options};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, conn: &mut Connection, message: Message) {
//!         let _ = conn.send_message(message.payload, message.is_binary);
//!     }
//! }
//!
//! # async fn run() -> wsengine::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     // the HTTP upgrade is performed on `stream` first
//!     tokio::spawn(async move {
//!         let handshake = Handshake::Server(ConnectionRequest::default());
//!         let _ = native::serve_tcp(stream, Options::server(), Echo, handshake, None).await;
//!     });
//! }
//! # }
//! ```
use std::time::Duration;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};

use crate::{
    compression::PerMessageCompress,
    engine::{Handler, WebSocketEngine},
    handshake::Handshake,
    options::Options,
    transport::{Reactor, TimerHandle, TimerToken, Transport},
    Result,
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

enum Command {
    Write(Bytes),
    Close,
    Abort,
}

/// The [`Transport`] end of a driver.
pub struct TokioTransport {
    commands: mpsc::UnboundedSender<Command>,
    peer: Option<String>,
}

impl Transport for TokioTransport {
    fn write(&mut self, data: Bytes) {
        let _ = self.commands.send(Command::Write(data));
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }

    fn abort(&mut self) {
        let _ = self.commands.send(Command::Abort);
    }

    fn remote_address(&self) -> Option<String> {
        self.peer.clone()
    }
}

/// The [`Reactor`] end of a driver. Timers are sleeping tasks on the current runtime.
pub struct TokioReactor {
    expired: mpsc::UnboundedSender<TimerToken>,
}

struct SleepHandle(AbortHandle);

impl TimerHandle for SleepHandle {
    fn cancel(&mut self) {
        self.0.abort();
    }
}

impl Reactor for TokioReactor {
    fn call_later(&mut self, delay: Duration, token: TimerToken) -> Box<dyn TimerHandle> {
        let expired = self.expired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = expired.send(token);
        });
        Box::new(SleepHandle(task.abort_handle()))
    }
}

/// The loop that owns the stream.
pub struct Driver {
    commands: mpsc::UnboundedReceiver<Command>,
    expired: mpsc::UnboundedReceiver<TimerToken>,
}

/// Creates a connected transport, reactor and driver.
pub fn channels(peer: Option<String>) -> (TokioTransport, TokioReactor, Driver) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (expired_tx, expired_rx) = mpsc::unbounded_channel();

    (
        TokioTransport {
            commands: commands_tx,
            peer,
        },
        TokioReactor {
            expired: expired_tx,
        },
        Driver {
            commands: commands_rx,
            expired: expired_rx,
        },
    )
}

impl Driver {
    /// Pumps bytes, writes and timers until the transport closes, then reports the
    /// connection as lost to the engine.
    pub async fn run<S, H>(mut self, stream: S, engine: &mut WebSocketEngine<H>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
        H: Handler,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv() => match command {
                    Command::Write(data) => {
                        if let Err(err) = writer.write_all(&data).await {
                            log::debug!("write failed: {err}");
                            break;
                        }
                    }
                    Command::Close => {
                        if let Err(err) = writer.shutdown().await {
                            log::debug!("shutdown failed: {err}");
                        }
                        break;
                    }
                    Command::Abort => break,
                },
                Some(token) = self.expired.recv() => engine.timer_fired(token),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        log::debug!("transport closed by peer");
                        break;
                    }
                    Ok(n) => engine.data_received(&buf[..n]),
                    Err(err) => {
                        log::debug!("read failed: {err}");
                        break;
                    }
                },
            }
        }

        engine.connection_lost();
    }
}

/// Runs a connection whose opening handshake completed on `stream`.
///
/// Returns the handler once the connection is closed.
pub async fn serve<S, H>(
    stream: S,
    peer: Option<String>,
    options: Options,
    handler: H,
    handshake: Handshake,
    compression: Option<Box<dyn PerMessageCompress>>,
) -> Result<H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    let (transport, reactor, driver) = channels(peer);
    let mut engine = WebSocketEngine::new(options, Box::new(transport), Box::new(reactor), handler)?;

    engine.connection_made();
    engine.open(&handshake, compression)?;
    driver.run(stream, &mut engine).await;

    Ok(engine.into_handler())
}

/// [`serve`] over TCP, applying [`Options::tcp_no_delay`].
pub async fn serve_tcp<H: Handler>(
    stream: TcpStream,
    options: Options,
    handler: H,
    handshake: Handshake,
    compression: Option<Box<dyn PerMessageCompress>>,
) -> Result<H> {
    stream.set_nodelay(options.tcp_no_delay)?;
    let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
    serve(stream, peer, options, handler, handshake, compression).await
}
