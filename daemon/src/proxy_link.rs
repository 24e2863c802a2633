//! Outbound link to a backend proxy.
//!
//! The agent dials the proxy and carries every client the proxy accepted as a
//! virtual connection over that one TLS stream. Each virtual connection is a
//! normal dispatcher session named `PXY:<address>`.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::HOST_TCP_PORT;
use crate::dispatcher::{Outbound, SessionKey};
use crate::event::AgentEvent;
use crate::multiplex::{MuxCodec, MuxEvent, Multiplexer, Unit};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WARN_EVERY_FAILURES: u64 = 250;

/// Running link task. Dropping the handle stops the link.
pub struct ProxyLink {
    server: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyLink {
    pub fn start(server: String, port: u16, connector: TlsConnector, events: mpsc::Sender<AgentEvent>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(server.clone(), port, connector, events, stop_rx));
        Self { server, stop, task }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Signals the link to close every virtual session and exit.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(true);
        self.task
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Lost,
    /// Stop was requested, or the agent dropped its event receiver.
    Stopped,
}

async fn run(
    server: String,
    port: u16,
    connector: TlsConnector,
    events: mpsc::Sender<AgentEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut failures: u64 = 0;
    loop {
        match connect(&server, port, &connector).await {
            Ok(stream) => {
                failures = 0;
                info!("connected to backend {server}:{port}");
                if serve(stream, &events, &mut stop).await == LinkEnd::Stopped {
                    return;
                }
                info!("backend link to {server}:{port} lost");
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % WARN_EVERY_FAILURES == 0 {
                    warn!("backend {server}:{port} unreachable ({failures} attempts): {e:#}");
                } else {
                    debug!("backend {server}:{port}: {e:#}");
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = stop.changed() => return,
        }
    }
}

async fn connect(
    server: &str,
    port: u16,
    connector: &TlsConnector,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((server, port)))
        .await
        .map_err(|_| anyhow!("TCP connect timed out"))?
        .with_context(|| format!("TCP connect to {server}:{port}"))?;
    let name = ServerName::try_from(server.to_string()).map_err(|e| anyhow!("invalid server name: {e}"))?;
    timeout(CONNECT_TIMEOUT, connector.connect(name, tcp))
        .await
        .map_err(|_| anyhow!("TLS handshake timed out"))?
        .context("TLS handshake failed")
}

/// Replies from the dispatcher side, tagged with their virtual connection.
#[derive(Debug)]
enum LinkOut {
    Frame(u32, Bytes),
    Close(u32),
}

struct VirtualSession {
    key: SessionKey,
    forwarder: JoinHandle<()>,
}

/// Drives one connected link until it drops or the link is stopped. Every
/// virtual session opened here is closed before returning.
async fn serve<S>(stream: S, events: &mpsc::Sender<AgentEvent>, stop: &mut watch::Receiver<bool>) -> LinkEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, MuxCodec::new());
    let mut mux = Multiplexer::new();
    let mut sessions: HashMap<u32, VirtualSession> = HashMap::new();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkOut>();

    let end = 'serve: loop {
        tokio::select! {
            unit = framed.next() => {
                let unit = match unit {
                    Some(Ok(unit)) => unit,
                    Some(Err(e)) => {
                        warn!("backend link: {e}");
                        break LinkEnd::Lost;
                    }
                    None => break LinkEnd::Lost,
                };
                for event in mux.receive(unit) {
                    match event {
                        MuxEvent::Opened { id, address } => {
                            let key = SessionKey::next();
                            let (outbound, replies) = mpsc::unbounded_channel();
                            let opened = AgentEvent::SessionOpened {
                                key,
                                id: format!("PXY:{address}"),
                                local: false,
                                outbound,
                            };
                            if events.send(opened).await.is_err() {
                                break 'serve LinkEnd::Stopped;
                            }
                            let forwarder = tokio::spawn(forward(id, replies, link_tx.clone()));
                            sessions.insert(id, VirtualSession { key, forwarder });
                        }
                        MuxEvent::Frame { id, payload } => {
                            if let Some(session) = sessions.get(&id) {
                                let frame = AgentEvent::Frame { key: session.key, payload };
                                if events.send(frame).await.is_err() {
                                    break 'serve LinkEnd::Stopped;
                                }
                            }
                        }
                        MuxEvent::Closed { id, notify_peer } => {
                            if notify_peer {
                                let _ = framed.send(Unit::closed(id)).await;
                            }
                            close_session(&mut sessions, id, events).await;
                        }
                        MuxEvent::Datagram { id, payload } => {
                            if id == u32::from(HOST_TCP_PORT) {
                                debug!("backend datagram ({} bytes)", payload.len());
                            } else {
                                debug!("ignoring datagram for port {id}");
                            }
                        }
                    }
                }
            }
            out = link_rx.recv() => match out {
                Some(LinkOut::Frame(id, bytes)) => {
                    if mux.contains(id) {
                        if let Err(e) = framed.send(Unit::frame(id, &bytes)).await {
                            warn!("backend link write failed: {e}");
                            break LinkEnd::Lost;
                        }
                    }
                }
                Some(LinkOut::Close(id)) => {
                    if let Some(unit) = mux.close(id) {
                        let _ = framed.send(unit).await;
                    }
                    close_session(&mut sessions, id, events).await;
                }
                None => break LinkEnd::Lost,
            },
            _ = stop.changed() => break LinkEnd::Stopped,
        }
    };

    mux.disconnect_all();
    for id in sessions.keys().copied().collect::<Vec<_>>() {
        close_session(&mut sessions, id, events).await;
    }
    if end == LinkEnd::Stopped {
        let _ = framed.close().await;
    }
    end
}

async fn close_session(sessions: &mut HashMap<u32, VirtualSession>, id: u32, events: &mpsc::Sender<AgentEvent>) {
    if let Some(session) = sessions.remove(&id) {
        session.forwarder.abort();
        let _ = events.send(AgentEvent::SessionClosed { key: session.key }).await;
    }
}

/// Tags one session's replies with its connection id.
async fn forward(id: u32, mut replies: mpsc::UnboundedReceiver<Outbound>, link: mpsc::UnboundedSender<LinkOut>) {
    while let Some(reply) = replies.recv().await {
        match reply {
            Outbound::Frame(bytes) => {
                if link.send(LinkOut::Frame(id, bytes)).is_err() {
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = link.send(LinkOut::Close(id));
}
