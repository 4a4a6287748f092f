//! TCP control socket.  Length-prefixed JSON `Message`s in both directions:
//! clients send `Command`s, the daemon answers with `Hello` on connect and
//! then pushes `State`, `Title` and `Log` broadcasts.

use std::sync::Arc;

use dial_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::core::DaemonEvent;
use crate::state::StateManager;
use crate::BroadcastMessage;

/// Frames larger than this are treated as garbage and the client is dropped.
const MAX_FRAME_LEN: usize = 1 << 20;

pub async fn bind(bind_address: &str, port: u16) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind((bind_address, port)).await?;
    info!("control socket listening at {}", listener.local_addr()?);
    Ok(listener)
}

pub fn start_server(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_id = 0usize;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("control socket: accept failed: {}", e);
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            info!("control client {} connected from {}", id, peer);

            let session = ClientSession {
                id,
                state_manager: Arc::clone(&state_manager),
                event_tx: event_tx.clone(),
            };
            let updates = broadcast_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = session.serve(stream, updates).await {
                    debug!("control client {}: {:#}", id, e);
                }
                info!("control client {} disconnected", id);
            });
        }
    })
}

/// Outcome of scanning the receive buffer.
#[derive(Debug, PartialEq)]
enum Frames {
    /// Complete commands, in arrival order.  Partial trailing data stays
    /// in the buffer.
    Commands(Vec<Command>),
    /// The peer announced an absurd frame length.
    Oversized(usize),
}

/// Pull every complete frame out of `buf`.  Frames that decode to
/// something other than a command, or fail to decode, are skipped.
fn take_commands(buf: &mut Vec<u8>) -> Frames {
    let mut commands = Vec::new();
    while buf.len() >= 4 {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Frames::Oversized(len);
        }
        if buf.len() < 4 + len {
            break;
        }
        match Message::decode(buf) {
            Ok((Message::Command(cmd), _)) => commands.push(cmd),
            Ok((other, _)) => debug!("control socket: ignoring non-command {:?}", other),
            Err(e) => warn!("control socket: undecodable frame ({} bytes): {}", len, e),
        }
        buf.drain(..4 + len);
    }
    Frames::Commands(commands)
}

struct ClientSession {
    id: usize,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl ClientSession {
    async fn serve(
        &self,
        stream: TcpStream,
        mut updates: broadcast::Receiver<BroadcastMessage>,
    ) -> anyhow::Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let hello = Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state: self.state_manager.get_state().await,
        };
        send(&mut writer, hello).await?;

        let mut chunk = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    pending.extend_from_slice(&chunk[..n]);
                    match take_commands(&mut pending) {
                        Frames::Commands(commands) => {
                            for cmd in commands {
                                if self.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                    anyhow::bail!("controller has stopped");
                                }
                            }
                        }
                        Frames::Oversized(len) => {
                            anyhow::bail!("frame of {} bytes exceeds limit", len);
                        }
                    }
                }

                update = updates.recv() => {
                    let outgoing = match update {
                        Ok(BroadcastMessage::StateUpdated) => Broadcast::State {
                            data: self.state_manager.get_state().await,
                        },
                        Ok(BroadcastMessage::TitleUpdated(title)) => Broadcast::Title { title },
                        Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("control client {} lagged by {} updates, resending state", self.id, n);
                            Broadcast::State {
                                data: self.state_manager.get_state().await,
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    };
                    send(&mut writer, outgoing).await?;
                }
            }
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
