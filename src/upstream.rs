//! The upstream side of a session: connect to the real server, replay the
//! login dialogue with the cached credentials, then pump whole packets into
//! the session's event loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

use crate::config::Config;
use crate::downstream::spawn_writer;
use crate::framing::PacketFramer;
use crate::proto::views::{
    AccountLogin, CharList, GameLogin, PlayCharacter, PlayServer, Relay, Seed, ServerList,
};
use crate::proto::{opcode, ProtocolVersion};
use crate::session::{SessionEvent, UpstreamHandle};

const RETRY_DELAY: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

fn version_seed(protocol: ProtocolVersion) -> Seed {
    let major = match protocol {
        ProtocolVersion::V6 => 6,
        ProtocolVersion::V7 => 7,
    };
    Seed {
        seed: rand::random(),
        major,
        minor: 0,
        revision: 15,
        prototype: 0,
    }
}

/// Run the full login dialogue and return the in-game stream.
pub async fn connect_and_login(
    config: &Config,
    protocol: ProtocolVersion,
) -> std::io::Result<TcpStream> {
    let addr = config.server_addr()?;
    let mut stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);

    stream.write_all(&version_seed(protocol).encode()).await?;
    stream
        .write_all(
            &AccountLogin {
                username: config.username.clone(),
                password: config.password.clone(),
            }
            .encode(),
        )
        .await?;

    let mut framer = PacketFramer::new(protocol);
    let server_list = loop {
        let packet = framer.read_packet(&mut stream).await?;
        match packet[0] {
            opcode::SERVER_LIST => {
                break ServerList::parse(&packet).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "malformed server list",
                    )
                })?;
            }
            opcode::LOGIN_REJECT => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!(
                        "login rejected, reason 0x{:02x}",
                        packet.get(1).copied().unwrap_or(0)
                    ),
                ));
            }
            other => debug!("ignoring login-phase packet 0x{other:02x}"),
        }
    };

    if config.server_index as usize >= server_list.entries.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "server index {} out of range ({} offered)",
                config.server_index,
                server_list.entries.len()
            ),
        ));
    }
    stream
        .write_all(
            &PlayServer {
                index: config.server_index,
            }
            .encode(),
        )
        .await?;

    let relay = loop {
        let packet = framer.read_packet(&mut stream).await?;
        match packet[0] {
            opcode::RELAY => {
                break Relay::parse(&packet).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed relay")
                })?;
            }
            other => debug!("ignoring login-phase packet 0x{other:02x}"),
        }
    };

    // Follow the redirect; an all-zero address means "same host".
    let game_addr = if relay.ip == [0, 0, 0, 0] {
        addr
    } else {
        SocketAddr::from((relay.ip, relay.port))
    };
    let mut stream = TcpStream::connect(game_addr).await?;
    let _ = stream.set_nodelay(true);

    // The relay auth id doubles as the seed of the game connection.
    stream.write_all(&relay.auth_id.to_be_bytes()).await?;
    stream
        .write_all(
            &GameLogin {
                auth_id: relay.auth_id,
                username: config.username.clone(),
                password: config.password.clone(),
            }
            .encode(),
        )
        .await?;

    let mut framer = PacketFramer::new(protocol);
    let char_list = loop {
        let packet = framer.read_packet(&mut stream).await?;
        match packet[0] {
            opcode::CHAR_LIST => {
                break CharList::parse(&packet).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "malformed character list",
                    )
                })?;
            }
            other => debug!("ignoring game-login packet 0x{other:02x}"),
        }
    };

    let slot = config.character_index;
    let name = char_list
        .names
        .get(slot as usize)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no character in slot {slot}"),
            )
        })?;
    stream
        .write_all(
            &PlayCharacter {
                name: name.clone(),
                slot,
            }
            .encode(),
        )
        .await?;

    info!("upstream login complete as '{}' (slot {slot})", name);
    Ok(stream)
}

/// Split the in-game stream into a writer queue and a reader task feeding
/// the session.
pub fn spawn_io(
    stream: TcpStream,
    protocol: ProtocolVersion,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
) -> UpstreamHandle {
    let (mut read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Bytes>();
    spawn_writer(write_half, write_rx);

    tokio::spawn(async move {
        let mut framer = PacketFramer::new(protocol);
        loop {
            match framer.read_packet(&mut read_half).await {
                Ok(packet) => {
                    if tx.send(SessionEvent::ServerPacket(packet)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("upstream read ended: {e}");
                    let _ = tx.send(SessionEvent::UpstreamClosed { generation });
                    return;
                }
            }
        }
    });

    UpstreamHandle::new(write_tx)
}

/// Connect (after `initial_delay`), retrying on the reconnect cadence until
/// the session goes away. Retries are unbounded: the session decides when
/// to stop wanting an upstream.
pub fn spawn_connect(
    config: Arc<Config>,
    protocol: ProtocolVersion,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
    initial_delay: Duration,
) {
    tokio::spawn(async move {
        let mut delay = initial_delay;
        loop {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            delay = RETRY_DELAY;

            if tx.is_closed() {
                return;
            }
            match time::timeout(LOGIN_TIMEOUT, connect_and_login(&config, protocol)).await {
                Ok(Ok(stream)) => {
                    let handle = spawn_io(stream, protocol, generation, tx.clone());
                    let _ = tx.send(SessionEvent::UpstreamConnected { generation, handle });
                    return;
                }
                Ok(Err(e)) => warn!("upstream connect failed: {e}"),
                Err(_) => warn!("upstream login timed out"),
            }
        }
    });
}
