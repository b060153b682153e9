//! Listener wiring: accept game clients, run the handshake, and hand
//! finished logins to a session (existing or fresh) from the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::Config;
use crate::downstream::{spawn_writer, ClientId, Downstream};
use crate::framing::PacketFramer;
use crate::handshake::{self, HandshakeOutcome, PendingLogins};
use crate::proto::ProtocolVersion;
use crate::registry::{Registry, SessionKey};
use crate::session::{Session, SessionEvent};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

fn session_key(config: &Config) -> SessionKey {
    SessionKey {
        username: config.username.clone(),
        server_index: config.server_index,
        character_index: config.character_index,
    }
}

pub async fn run(config: Config) -> std::io::Result<()> {
    let config = Arc::new(config);
    let registry = Arc::new(Registry::new());
    let pending = Arc::new(PendingLogins::new());
    let next_client_id = Arc::new(AtomicU64::new(1));

    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr).await?;
    info!(
        "listening on {bind_addr}, upstream {}",
        config.server_address
    );

    if config.background {
        // Warm the upstream session before the first head shows up.
        let key = session_key(&config);
        registry.attach_or_start(&key, || {
            Session::start(
                config.clone(),
                key.clone(),
                ProtocolVersion::V7,
                registry.clone(),
            )
        });
    }

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("Accept failed: {e}");
                continue;
            }
        };
        debug!("connection from {addr}");
        let _ = stream.set_nodelay(true);

        let config = config.clone();
        let registry = registry.clone();
        let pending = pending.clone();
        let next_client_id = next_client_id.clone();
        tokio::spawn(async move {
            match timeout(
                HANDSHAKE_TIMEOUT,
                handshake::serve(stream, &config, &pending),
            )
            .await
            {
                Ok(Ok(HandshakeOutcome::Relayed)) => {
                    debug!("{addr} relayed back for game login");
                }
                Ok(Ok(HandshakeOutcome::Play {
                    stream,
                    framer,
                    protocol,
                })) => {
                    let id = next_client_id.fetch_add(1, Ordering::Relaxed);
                    attach_client(id, stream, framer, protocol, config, registry);
                }
                Ok(Err(e)) => debug!("{addr} handshake failed: {e}"),
                Err(_) => debug!("{addr} handshake timed out"),
            }
        });
    }
}

fn attach_client(
    id: ClientId,
    stream: TcpStream,
    mut framer: PacketFramer,
    protocol: ProtocolVersion,
    config: Arc<Config>,
    registry: Arc<Registry>,
) {
    let key = session_key(&config);
    let handle = registry.attach_or_start(&key, || {
        Session::start(config.clone(), key.clone(), protocol, registry.clone())
    });
    let Some(handle) = handle else {
        // Dropping the stream closes it; the client sees a disconnect at
        // character selection.
        info!("refusing client {id}: session for {} is busy", key.username);
        return;
    };

    let (mut read_half, write_half) = stream.into_split();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    spawn_writer(write_half, write_rx);

    let endpoint = Downstream::new(id, protocol, write_tx);
    if handle.tx.send(SessionEvent::Attach(endpoint)).is_err() {
        debug!("session closed before client {id} could attach");
        return;
    }

    let session_tx = handle.tx;
    tokio::spawn(async move {
        loop {
            match framer.read_packet(&mut read_half).await {
                Ok(packet) => {
                    if session_tx
                        .send(SessionEvent::ClientPacket(id, packet))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    debug!("client {id} read ended: {e}");
                    let _ = session_tx.send(SessionEvent::ClientClosed(id));
                    return;
                }
            }
        }
    });
}
