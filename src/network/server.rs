//! TCP front end: accept loop, connection phase, and the command loop that
//! hands each decoded command to the dispatcher.
//!
//! Dispatch is synchronous (lock waits, SLEEP, the engine), so each command
//! runs on the blocking pool with the session moved in and back out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::constants::capability;
use super::handshake::{HandshakeResponse, InitialHandshake, auth_switch_request};
use super::packet::{CommandEnvelope, PacketError, PacketReader, send_frames, write_frames};
use super::response::{Response, ResponseBuffer};
use crate::core::{ServerError, ServerInstance, Timeout, User};
use crate::dispatch::{Dispatcher, Flow};
use crate::engine::ExecOutcome;
use crate::session::Session;

/// How often a connection blocked on the client checks for KILL.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server {
    instance: Arc<ServerInstance>,
}

impl Server {
    #[must_use]
    pub const fn new(instance: Arc<ServerInstance>) -> Self {
        Self { instance }
    }

    #[must_use]
    pub const fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }

    pub async fn start(&self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "myrustqld ready for connections");
        self.serve(listener).await
    }

    /// Accepts connections until shutdown is requested.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.instance.subscribe_shutdown();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "new connection");
                    let instance = Arc::clone(&self.instance);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(instance, socket, peer).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("listener closed");
        Ok(())
    }
}

async fn handle_connection(
    instance: Arc<ServerInstance>,
    socket: TcpStream,
    peer: SocketAddr,
) -> Result<(), PacketError> {
    socket.set_nodelay(true)?;
    let (reader, mut writer) = socket.into_split();
    let mut reader = PacketReader::new(reader, instance.config.network.max_allowed_packet);
    let host = peer.ip().to_string();

    let session = match connect(&instance, &mut reader, &mut writer, &host).await {
        Ok(Some(session)) => session,
        Ok(None) => return Ok(()),
        Err(e) => {
            instance.status.aborted_connects.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };
    instance.status.connections.fetch_add(1, Ordering::Relaxed);
    if let Some(handle) = instance.registry.get(session.id()) {
        reader.set_idle_marker(handle.idle_marker());
    }
    info!(session = session.id(), user = %session.user().username, %host, "connected");

    match command_loop(&instance, session, &mut reader, &mut writer).await {
        Err(PacketError::Closed) => Ok(()),
        other => other,
    }
}

/// Handshake and authentication. `None` when the client was refused; the
/// refusal has been sent.
async fn connect<R, W>(
    instance: &ServerInstance,
    reader: &mut PacketReader<R>,
    writer: &mut W,
    host: &str,
) -> Result<Option<Session>, PacketError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let timeout = instance.config.network.read_timeout();
    let id = instance.registry.allocate_id();
    let handshake = InitialHandshake::new(id);
    send_payload(writer, &handshake.payload(), 0).await?;

    let packet = reader.read_packet(timeout).await?;
    let response = match HandshakeResponse::parse(packet) {
        Ok(response) => response,
        Err(e) => return refuse(instance, writer, reader.reply_seq(), 0, &e).await,
    };
    let capabilities = response.capabilities & handshake.capabilities;

    let token = if response.needs_auth_switch() {
        send_payload(writer, &auth_switch_request(&handshake.scramble), reader.reply_seq()).await?;
        reader.read_packet(timeout).await?.to_vec()
    } else {
        response.auth_response.clone()
    };

    let user = match authorize(instance, &response, &handshake.scramble, &token, host) {
        Ok(user) => user,
        Err(e) => return refuse(instance, writer, reader.reply_seq(), capabilities, &e).await,
    };
    debug!(session = id, attrs = ?response.connect_attrs, "client attributes");

    let mut session = match Session::new(instance, id, user, host, capabilities) {
        Ok(session) => session,
        Err(e) => return refuse(instance, writer, reader.reply_seq(), capabilities, &e).await,
    };
    session.set_scramble(&handshake.scramble);
    session.set_db(response.database);

    let mut out = ResponseBuffer::new();
    session.send_ok(&mut out, &ExecOutcome::affected(0));
    send_frames(writer, &out.encode(reader.reply_seq(), capabilities)).await?;
    Ok(Some(session))
}

/// Credentials, then the initial database. An expired password is only
/// accepted from clients that can handle the restricted mode.
fn authorize(
    instance: &ServerInstance,
    response: &HandshakeResponse,
    scramble: &[u8],
    token: &[u8],
    host: &str,
) -> Result<User, ServerError> {
    let user = instance
        .users
        .authenticate(&response.username, scramble, token, host)?;
    if user.password_expired && response.capabilities & capability::CAN_HANDLE_EXPIRED_PASSWORDS == 0 {
        return Err(ServerError::MustChangePassword);
    }
    if let Some(db) = &response.database {
        if !user.has_any_on_db(db) {
            return Err(ServerError::DbAccessDenied {
                user: user.username,
                host: host.to_string(),
                db: db.clone(),
            });
        }
        if !instance.engine.database_exists(db) {
            return Err(ServerError::UnknownDatabase(db.clone()));
        }
    }
    Ok(user)
}

async fn refuse<W: AsyncWrite + Unpin>(
    instance: &ServerInstance,
    writer: &mut W,
    seq: u8,
    capabilities: u32,
    err: &ServerError,
) -> Result<Option<Session>, PacketError> {
    instance.status.aborted_connects.fetch_add(1, Ordering::Relaxed);
    info!(error = %err, "connection refused");
    send_response(writer, &Response::error(err), seq, capabilities).await?;
    Ok(None)
}

async fn command_loop<R, W>(
    instance: &Arc<ServerInstance>,
    mut session: Session,
    reader: &mut PacketReader<R>,
    writer: &mut W,
) -> Result<(), PacketError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let capabilities = session.capabilities();
    let kill = session.kill_token().clone();
    let result = loop {
        let vars = session.variables();
        let wait = Timeout::from_seconds(vars.get_u32("wait_timeout"));
        let read = Timeout::from_seconds(vars.get_u32("net_read_timeout"));
        reader.set_max_allowed_packet(
            usize::try_from(vars.get_u64("max_allowed_packet")).unwrap_or(usize::MAX),
        );

        let envelope = {
            let next = reader.read_command(wait, read);
            tokio::pin!(next);
            let mut ticker = tokio::time::interval(KILL_POLL_INTERVAL);
            loop {
                tokio::select! {
                    envelope = &mut next => break Some(envelope),
                    _ = ticker.tick() => {
                        if kill.is_connection_killed() {
                            break None;
                        }
                    }
                }
            }
        };
        let envelope = match envelope {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => break Err(e),
            None => {
                debug!(session = session.id(), "killed while idle");
                break Ok(());
            }
        };

        let seq = reader.reply_seq();
        let (returned, flow, out) = run_command(Arc::clone(instance), session, envelope).await?;
        session = returned;
        let frames = out.encode(seq, capabilities);
        if !frames.is_empty() {
            send_frames(writer, &frames).await?;
        }
        if flow == Flow::Terminate {
            break Ok(());
        }
    };

    if let Err(e) = &result {
        if let Some(err) = e.client_error() {
            // the peer may already be gone
            let _ = send_response(writer, &Response::error(&err), reader.reply_seq(), capabilities).await;
        }
    }
    session.reset_state(instance);
    info!(session = session.id(), "disconnected");
    result
}

async fn run_command(
    instance: Arc<ServerInstance>,
    mut session: Session,
    envelope: CommandEnvelope,
) -> Result<(Session, Flow, ResponseBuffer), PacketError> {
    tokio::task::spawn_blocking(move || {
        let mut out = ResponseBuffer::new();
        let flow = Dispatcher::new(&instance).dispatch(&mut session, &envelope, &mut out);
        (session, flow, out)
    })
    .await
    .map_err(|e| PacketError::Io(io::Error::other(e)))
}

async fn send_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    seq: u8,
) -> io::Result<()> {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    write_frames(&mut out, payload, seq);
    send_frames(writer, &out).await
}

async fn send_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
    seq: u8,
    capabilities: u32,
) -> io::Result<()> {
    let mut out = BytesMut::new();
    response.encode(&mut out, seq, capabilities);
    send_frames(writer, &out).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ServerConfig, scramble_password};
    use crate::network::packet::{put_lenenc_int, put_null_str};
    use bytes::BufMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start() -> (Arc<ServerInstance>, SocketAddr) {
        let mut config = ServerConfig::default();
        config.server.superuser_password = "secret".to_string();
        let instance = Arc::new(ServerInstance::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(Arc::clone(&instance));
        tokio::spawn(async move { server.serve(listener).await });
        (instance, addr)
    }

    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (header[3], payload)
    }

    async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) {
        let mut out = BytesMut::new();
        write_frames(&mut out, payload, seq);
        stream.write_all(&out).await.unwrap();
    }

    /// Scramble from a HandshakeV10 payload.
    fn scramble_of(greeting: &[u8]) -> Vec<u8> {
        let version_end = greeting[1..].iter().position(|b| *b == 0).unwrap() + 1;
        let part1 = &greeting[version_end + 5..version_end + 13];
        let part2_start = version_end + 13 + 1 + 2 + 1 + 2 + 2 + 1 + 10;
        let mut scramble = part1.to_vec();
        scramble.extend_from_slice(&greeting[part2_start..part2_start + 12]);
        scramble
    }

    async fn login(addr: SocketAddr, user: &str, password: &str) -> (TcpStream, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (_, greeting) = read_packet(&mut stream).await;
        let token = scramble_password(&scramble_of(&greeting), password);

        let mut p = BytesMut::new();
        p.put_u32_le(capability::SERVER_DEFAULT & !capability::PLUGIN_AUTH_LENENC_CLIENT_DATA);
        p.put_u32_le(1 << 24);
        p.put_u8(33);
        p.put_slice(&[0u8; 23]);
        put_null_str(&mut p, user);
        p.put_u8(u8::try_from(token.len()).unwrap());
        p.put_slice(&token);
        put_null_str(&mut p, "test");
        put_null_str(&mut p, "mysql_native_password");
        put_lenenc_int(&mut p, 0);
        write_packet(&mut stream, 1, &p).await;
        let (_, reply) = read_packet(&mut stream).await;
        (stream, reply)
    }

    #[tokio::test]
    async fn test_login_and_query() {
        let (instance, addr) = start().await;
        let (mut stream, reply) = login(addr, "root", "secret").await;
        assert_eq!(reply[0], 0x00, "expected OK, got {reply:?}");
        assert_eq!(instance.status.connections.load(Ordering::Relaxed), 1);

        write_packet(&mut stream, 0, b"\x03SELECT 1").await;
        let (seq, column_count) = read_packet(&mut stream).await;
        assert_eq!(seq, 1);
        assert_eq!(column_count, vec![1]);

        write_packet(&mut stream, 0, b"\x01").await;
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_is_refused() {
        let (instance, addr) = start().await;
        let (_, reply) = login(addr, "root", "nope").await;
        assert_eq!(reply[0], 0xFF);
        assert_eq!(u16::from_le_bytes([reply[1], reply[2]]), 1045);
        assert_eq!(instance.status.aborted_connects.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_kill_closes_idle_connection() {
        let (instance, addr) = start().await;
        let (mut stream, reply) = login(addr, "root", "secret").await;
        assert_eq!(reply[0], 0x00);
        let id = instance.registry.handles()[0].id;
        instance
            .registry
            .kill(id, crate::session::KillState::ConnectionKilled)
            .unwrap();
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let (instance, addr) = start().await;
        instance.request_shutdown(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let attempt = TcpStream::connect(addr).await;
        if let Ok(mut stream) = attempt {
            // accepted by the OS backlog at most; the server never greets
            let mut buf = [0u8; 4];
            let read = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
            assert!(!matches!(read, Ok(Ok(n)) if n > 0));
        }
    }
}
