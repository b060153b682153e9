//! The pre-game dialogue the proxy serves to a connecting client.
//!
//! A client first talks to the proxy as if it were a login server: account
//! login, a one-entry shard list, then a relay pointing straight back at
//! the proxy. The client reconnects with the relay's auth id, logs into the
//! "game server", picks a character, and is then handed to the session
//! layer for attachment. Credentials are checked against the configured
//! account.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::framing::PacketFramer;
use crate::proto::views::{
    AccountLogin, CharList, GameLogin, PlayCharacter, PlayServer, Relay, Seed, ServerEntry,
    ServerList, CONSOLE_NAME,
};
use crate::proto::{opcode, ProtocolVersion};

const REJECT_BAD_PASSWORD: u8 = 0x03;

/// Auth ids handed out in relays, mapping the two TCP connections of one
/// login together (and carrying the revision announced on the first one).
#[derive(Default)]
pub struct PendingLogins {
    inner: Mutex<FxHashMap<u32, ProtocolVersion>>,
}

impl PendingLogins {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, auth_id: u32, protocol: ProtocolVersion) {
        self.inner.lock().insert(auth_id, protocol);
    }

    fn take(&self, auth_id: u32) -> Option<ProtocolVersion> {
        self.inner.lock().remove(&auth_id)
    }
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Login-phase connection: relay sent, the client reconnects.
    Relayed,
    /// Game-phase connection, ready to attach to a session. The framer may
    /// already hold pipelined bytes and must stay with the stream.
    Play {
        stream: TcpStream,
        framer: PacketFramer,
        protocol: ProtocolVersion,
    },
}

async fn reject(stream: &mut TcpStream, reason: u8) -> std::io::Error {
    let _ = stream.write_all(&[opcode::LOGIN_REJECT, reason]).await;
    std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "client credentials do not match the configured account",
    )
}

pub async fn serve(
    mut stream: TcpStream,
    config: &Config,
    pending: &PendingLogins,
) -> std::io::Result<HandshakeOutcome> {
    let mut framer = PacketFramer::new(ProtocolVersion::V7);

    // The connection opens with either a modern 0xEF seed announcing the
    // client version, or a bare 4-byte seed (on a post-relay connection
    // that is the auth id).
    let mut seed_protocol = None;
    let mut raw_seed = 0u32;
    {
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await?;
        if first[0] == opcode::SEED {
            let mut rest = [0u8; 20];
            stream.read_exact(&mut rest).await?;
            let mut packet = vec![opcode::SEED];
            packet.extend_from_slice(&rest);
            if let Some(seed) = Seed::parse(&packet) {
                seed_protocol = Some(ProtocolVersion::from_major(seed.major));
            }
        } else {
            let mut rest = [0u8; 3];
            stream.read_exact(&mut rest).await?;
            raw_seed = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
        }
    }

    let packet = framer.read_packet(&mut stream).await?;
    match packet[0] {
        opcode::ACCOUNT_LOGIN => {
            let Some(login) = AccountLogin::parse(&packet) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "malformed account login",
                ));
            };
            if login.username != config.username || login.password != config.password {
                return Err(reject(&mut stream, REJECT_BAD_PASSWORD).await);
            }

            let list = ServerList {
                entries: vec![ServerEntry {
                    index: 0,
                    name: CONSOLE_NAME.into(),
                }],
            };
            stream.write_all(&list.encode()).await?;

            let packet = framer.read_packet(&mut stream).await?;
            if PlayServer::parse(&packet).is_none() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected shard selection, got 0x{:02x}", packet[0]),
                ));
            }

            // The client echoes the auth id as the seed of its next
            // connection; pin the high byte so it cannot look like a 0xEF
            // seed packet.
            let auth_id = (rand::random::<u32>() & 0x00ff_ffff) | 0x7f00_0000;
            let protocol = seed_protocol.unwrap_or(ProtocolVersion::V6);
            pending.insert(auth_id, protocol);

            // Point the client back at the address it reached us on.
            let local = stream.local_addr()?;
            let ip = match local.ip() {
                std::net::IpAddr::V4(v4) => v4.octets(),
                std::net::IpAddr::V6(_) => [0, 0, 0, 0],
            };
            let relay = Relay {
                ip,
                port: local.port(),
                auth_id,
            };
            stream.write_all(&relay.encode()).await?;
            Ok(HandshakeOutcome::Relayed)
        }
        opcode::GAME_LOGIN => {
            let Some(login) = GameLogin::parse(&packet) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "malformed game login",
                ));
            };
            if login.username != config.username || login.password != config.password {
                return Err(reject(&mut stream, REJECT_BAD_PASSWORD).await);
            }

            // The relay carried the announced revision; a direct game login
            // falls back to the seed, then to V6.
            let protocol = pending
                .take(login.auth_id)
                .or_else(|| pending.take(raw_seed))
                .or(seed_protocol)
                .unwrap_or(ProtocolVersion::V6);
            framer.set_protocol(protocol);

            stream
                .write_all(&[opcode::SUPPORTED_FEATURES, 0, 0, 0, 0])
                .await?;
            let chars = CharList {
                names: vec![config.username.clone()],
            };
            stream.write_all(&chars.encode()).await?;

            let packet = framer.read_packet(&mut stream).await?;
            if PlayCharacter::parse(&packet).is_none() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected character selection, got 0x{:02x}", packet[0]),
                ));
            }

            Ok(HandshakeOutcome::Play {
                stream,
                framer,
                protocol,
            })
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected handshake opcode 0x{other:02x}"),
        )),
    }
}
