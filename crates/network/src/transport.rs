//! Websocket plumbing: dialing, accepting and pumping frames between
//! sockets and sessions.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jointmesh_network_primitives::codec::{decode, encode};
use jointmesh_network_primitives::frame::{Command, Frame, Subject};
use jointmesh_primitives::common::random_token;
use jointmesh_primitives::peer::host_of;
use jointmesh_store::types::BAD_STATS_WINDOW;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::{select, spawn};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::NetworkClient;
use crate::registry::Connecting;
use crate::session::{Direction, Outgoing, Session, CLOSE_NORMAL};
use crate::types::NetworkEvent;

const REAL_IP_HEADER: &str = "x-real-ip";
const CHALLENGE_LENGTH: usize = 30;

impl NetworkClient {
    /// Returns the outbound session to `url`, dialing it unless a session
    /// exists or a dial is already in flight.
    pub async fn connect(&self, url: &str) -> EyreResult<Arc<Session>> {
        let url = url.to_lowercase();

        if let Some(session) = self.outbound_by_url(&url) {
            return Ok(session);
        }

        let registry = &self.inner.registry;

        if let Connecting::Waiting(receiver) = registry.begin_connecting(&url) {
            return receiver
                .await
                .map_err(|_| eyre!("connection attempt to {url} was abandoned"))?
                .map_err(|err| eyre!(err));
        }

        let result = self.dial(&url).await;

        let shared = result
            .as_ref()
            .map(Arc::clone)
            .map_err(|err| format!("{err:#}"));
        registry.finish_connecting(&url, &shared);

        result
    }

    async fn dial(&self, url: &str) -> EyreResult<Arc<Session>> {
        if !url.starts_with("ws://") {
            bail!("unsupported peer url {url}");
        }

        self.directory()
            .add_peer(url, None)
            .await
            .wrap_err("failed to record peer")?;

        debug!(%url, "connecting");

        let (stream, _response) = timeout(self.config().timeouts.connect, connect_async(url))
            .await
            .map_err(|_| eyre!("timed out connecting to {url}"))?
            .wrap_err_with(|| format!("failed to connect to {url}"))?;

        if let Some(existing) = self.outbound_by_url(url) {
            debug!(%url, "already connected, dropping the new socket");
            return Ok(existing);
        }

        let (session, outgoing) =
            Session::new(Direction::Outbound, url.to_owned(), host_of(url).to_owned());

        self.inner.registry.register(Arc::clone(&session));

        info!(peer = %url, "connected");

        session.send_version();
        if let Some(my_url) = &self.config().my_url {
            session.send_justsaying(Subject::MyUrl, Value::from(my_url.as_str()));
        }

        self.start_session(stream, Arc::clone(&session), outgoing)
            .await;

        Ok(session)
    }

    async fn accept(&self, stream: TcpStream, remote: SocketAddr) -> EyreResult<()> {
        let mut real_ip = None;

        let mut stream = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                real_ip = request
                    .headers()
                    .get(REAL_IP_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(ToOwned::to_owned);
                Ok(response)
            },
        )
        .await
        .wrap_err("websocket handshake failed")?;

        let host = match real_ip {
            Some(real_ip) if is_proxy_address(remote.ip()) => real_ip,
            _ => remote.ip().to_string(),
        };
        let peer = format!("{host}:{}", remote.port());

        let (inbound, _) = self.connection_counts();
        if inbound >= self.config().max_inbound {
            info!(%peer, "inbound connections maxed out, rejecting");
            close_socket(&mut stream, "inbound connections maxed out").await;
            return Ok(());
        }

        let stats = self
            .directory()
            .recent_events(&host, BAD_STATS_WINDOW)
            .await
            .wrap_err("failed to read peer stats")?;
        if stats.invalid > 0 {
            info!(%peer, invalid = stats.invalid, "rejecting peer that recently sent invalid joints");
            close_socket(&mut stream, "you have sent invalid joints recently").await;
            return Ok(());
        }

        self.directory()
            .add_peer_host(&host)
            .await
            .wrap_err("failed to record peer host")?;

        let (session, outgoing) = Session::new(Direction::Inbound, peer, host);

        self.inner.registry.register(Arc::clone(&session));

        info!(peer = %session.peer(), "accepted connection");

        session.send_version();
        if self.is_hub() {
            let challenge = random_token(CHALLENGE_LENGTH);
            session.update_flags(|flags| flags.challenge = Some(challenge.clone()));
            session.send_justsaying(Subject::HubChallenge, Value::from(challenge));
        }

        self.start_session(stream, session, outgoing).await;

        Ok(())
    }

    async fn start_session<S>(
        &self,
        stream: WebSocketStream<S>,
        session: Arc<Session>,
        outgoing: mpsc::UnboundedReceiver<Outgoing>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();

        let writer = spawn(write_frames(Arc::clone(&session), outgoing, sink));

        self.emit(NetworkEvent::Connected {
            session: Arc::clone(&session),
        })
        .await;

        drop(spawn(self.clone().read_frames(session, source, writer)));
    }

    async fn read_frames<S>(
        self,
        session: Arc<Session>,
        mut source: SplitStream<WebSocketStream<S>>,
        mut writer: tokio::task::JoinHandle<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let message = select! {
                message = source.next() => message,
                _ = &mut writer => break,
            };

            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    debug!(peer = %session.peer(), %err, "failed to read message");
                    break;
                }
                None => break,
            };

            session.touch();

            match message {
                Message::Text(text) => self.dispatch_frame(&session, &text).await,
                Message::Close(frame) => {
                    debug!(peer = %session.peer(), ?frame, "peer closed the connection");
                    break;
                }
                Message::Binary(_) => {
                    debug!(peer = %session.peer(), "ignoring binary message");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        self.session_closed(&session).await;
    }

    /// Routes one received wire frame. Responses complete pending requests,
    /// everything else becomes a [`NetworkEvent`].
    pub(crate) async fn dispatch_frame(&self, session: &Arc<Session>, text: &str) {
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %session.peer(), %err, "malformed message");
                session.send_error("malformed message");
                return;
            }
        };

        match frame {
            Frame::Response(response) => self.inner.correlator.complete(session, response),
            Frame::Justsaying(justsaying) => {
                debug!(peer = %session.peer(), subject = %justsaying.subject, "received notice");

                self.emit(NetworkEvent::Justsaying {
                    session: Arc::clone(session),
                    justsaying,
                })
                .await;
            }
            Frame::Request(request) => {
                if !session.begin_response(&request.tag) {
                    debug!(peer = %session.peer(), tag = %request.tag, "already answering identical request");
                    return;
                }

                if request.command == Command::Heartbeat.as_ref() {
                    session.send_response(&request.tag, None);
                    return;
                }

                debug!(peer = %session.peer(), command = %request.command, "received request");

                self.emit(NetworkEvent::Request {
                    session: Arc::clone(session),
                    request,
                })
                .await;
            }
        }
    }

    pub(crate) async fn session_closed(&self, session: &Arc<Session>) {
        let registered = self.inner.registry.remove(session);

        self.inner.correlator.on_session_closed(session).await;

        if registered {
            info!(peer = %session.peer(), direction = ?session.direction(), "connection closed");

            self.emit(NetworkEvent::Disconnected {
                session: Arc::clone(session),
            })
            .await;
        }
    }

    pub(crate) async fn emit(&self, event: NetworkEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("network event receiver is gone");
        }
    }
}

pub(crate) async fn listen(client: NetworkClient, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept connection");
                continue;
            }
        };

        let client = client.clone();
        drop(spawn(async move {
            if let Err(err) = client.accept(stream, remote).await {
                debug!(%remote, ?err, "inbound connection failed");
            }
        }));
    }
}

async fn write_frames<S>(
    session: Arc<Session>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(frame) => {
                let text = match encode(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(peer = %session.peer(), %err, "failed to encode frame");
                        continue;
                    }
                };

                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(peer = %session.peer(), %err, "failed to send frame");
                    break;
                }
            }
            Outgoing::Close(code, reason) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::from(reason),
                };

                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(peer = %session.peer(), %err, "failed to send close frame");
                }
                let _ignored = sink.close().await;
                break;
            }
        }
    }
}

async fn close_socket<S>(stream: &mut WebSocketStream<S>, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(CLOSE_NORMAL),
        reason: Cow::Borrowed(reason),
    };

    let _ignored = stream.close(Some(frame)).await;
}

/// Addresses a reverse proxy would connect from.
fn is_proxy_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private(),
        IpAddr::V6(ip) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
#[path = "tests/transport.rs"]
mod tests;
