//! TLS listener and per-session framing tasks.
//!
//! Each accepted connection gets its own task owning the `Framed` stream.
//! Decoded frames go to the agent in arrival order; replies come back on the
//! session's own unbounded channel so the agent never awaits a slow peer.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::dispatcher::{Outbound, SessionKey};
use crate::event::AgentEvent;
use crate::protocol::FrameCodec;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub fn session_id(peer: &SocketAddr) -> String {
    format!("TCP:{}:{}", peer.ip(), peer.port())
}

pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((address, port))
        .await
        .with_context(|| format!("Failed to listen on {address}:{port}"))?;
    info!("listening on {}", listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
    Ok(listener)
}

/// Accepts connections forever, upgrading each to TLS on its own task.
pub async fn run_listener(listener: TcpListener, acceptor: TlsAcceptor, events: mpsc::Sender<AgentEvent>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    run_session(stream, session_id(&peer), peer.ip().is_loopback(), events).await;
                }
                Ok(Err(e)) => warn!("TLS handshake with {peer} failed: {e}"),
                Err(_) => warn!("TLS handshake with {peer} timed out"),
            }
        });
    }
}

/// Runs one session until either side closes it. Always reports
/// `SessionClosed` after a successful `SessionOpened`.
pub async fn run_session<S>(stream: S, id: String, local: bool, events: mpsc::Sender<AgentEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = SessionKey::next();
    let (outbound, mut replies) = mpsc::unbounded_channel();
    let opened = AgentEvent::SessionOpened {
        key,
        id: id.clone(),
        local,
        outbound,
    };
    if events.send(opened).await.is_err() {
        return;
    }

    let mut framed = Framed::new(stream, FrameCodec::new());
    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(payload)) => {
                    if events.send(AgentEvent::Frame { key, payload }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("session {id}: {e}");
                    break;
                }
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = framed.send(bytes).await {
                        debug!("session {id}: write failed: {e}");
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
        }
    }

    let _ = framed.close().await;
    let _ = events.send(AgentEvent::SessionClosed { key }).await;
}
