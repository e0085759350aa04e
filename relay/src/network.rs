//! Relay network layer: UDP transport, routing and document persistence

use crate::document::DocumentStore;
use crate::participant_manager::ParticipantManager;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::clock::get_timestamp;
use shared::{ParticipantId, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Largest datagram the relay accepts. Join replies carry the whole scene
/// document, so this is sized for UDP rather than for snapshots.
pub const MAX_DATAGRAM: usize = 65_507;

/// Messages sent from network tasks to the main relay loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ParticipantTimeout {
        participant_id: ParticipantId,
    },
    Shutdown,
}

/// Messages sent from the relay loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<ParticipantId>,
    },
    /// Delivered only to elevated participants.
    AuthorityPacket {
        packet: Packet,
    },
}

/// Relay server: pub/sub fan-out, authority routing and the shared scene
/// document
pub struct RelayServer {
    socket: Arc<UdpSocket>,
    participants: Arc<RwLock<ParticipantManager>>,
    document: DocumentStore,
    save_interval: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl RelayServer {
    pub async fn new(
        addr: &str,
        max_participants: usize,
        document: DocumentStore,
        save_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Relay listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(RelayServer {
            socket,
            participants: Arc::new(RwLock::new(ParticipantManager::new(max_participants))),
            document,
            save_interval,
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that can stop a running relay with [`ServerMessage::Shutdown`].
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let participants = Arc::clone(&self.participants);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let (packet, targets) = match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                        continue;
                    }
                    OutboundMessage::BroadcastPacket { packet, exclude } => {
                        let targets: Vec<(ParticipantId, SocketAddr)> = participants
                            .read()
                            .await
                            .addrs()
                            .into_iter()
                            .filter(|(id, _)| Some(*id) != exclude)
                            .collect();
                        (packet, targets)
                    }
                    OutboundMessage::AuthorityPacket { packet } => {
                        let targets = participants.read().await.authority_addrs();
                        (packet, targets)
                    }
                };

                for (participant_id, addr) in targets {
                    if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                        error!("Failed to send to participant {}: {}", participant_id, e);
                    }
                }
            }
        });
    }

    /// Spawns task that monitors participant timeouts
    fn spawn_timeout_checker(&self) {
        let participants = Arc::clone(&self.participants);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = participants.write().await.check_timeouts();

                for participant_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ParticipantTimeout { participant_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn queue(&self, message: OutboundMessage) {
        if let Err(e) = self.out_tx.send(message) {
            error!("Failed to queue outgoing packet: {}", e);
        }
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        self.queue(OutboundMessage::SendPacket { packet, addr });
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<ParticipantId>) {
        self.queue(OutboundMessage::BroadcastPacket { packet, exclude });
    }

    async fn broadcast_membership(&self) {
        let participants = self.participants.read().await.membership();
        debug!("Membership now {} participant(s)", participants.len());
        self.broadcast_packet(Packet::Membership { participants }, None);
    }

    /// Routes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        if let Packet::Join {
            client_version,
            name,
            elevated,
        } = packet
        {
            self.handle_join(client_version, &name, elevated, addr).await;
            return;
        }

        let Some(from) = self.participants.write().await.touch(addr) else {
            debug!("Ignoring packet from unknown address {}", addr);
            self.send_packet(
                Packet::Rejected {
                    reason: "Not joined".to_string(),
                },
                addr,
            );
            return;
        };

        match packet {
            Packet::Publish { topic } => {
                self.broadcast_packet(Packet::Delivered { from, topic }, None);
            }

            Packet::ToAuthority { request } => {
                let has_authority = !self.participants.read().await.authority_addrs().is_empty();
                if has_authority {
                    self.queue(OutboundMessage::AuthorityPacket {
                        packet: Packet::AuthorityRequest { from, request },
                    });
                } else {
                    warn!(
                        "Dropping authority request from participant {}: no elevated participant connected",
                        from
                    );
                }
            }

            Packet::StoreWrite { write } => {
                if let Some(revision) = self.document.apply(&write) {
                    debug!("Document revision {} from participant {}", revision, from);
                    self.broadcast_packet(Packet::StoreChanged { revision, write }, Some(from));
                }
            }

            Packet::Ping { sent_at } => {
                self.send_packet(
                    Packet::Pong {
                        sent_at,
                        server_time: get_timestamp(),
                    },
                    addr,
                );
            }

            Packet::Leave => {
                let removed = self.participants.write().await.remove_participant(&from);
                if removed {
                    self.broadcast_membership().await;
                }
            }

            _ => {
                warn!("Unexpected packet type from participant at {}", addr);
            }
        }
    }

    async fn handle_join(&mut self, client_version: u32, name: &str, elevated: bool, addr: SocketAddr) {
        info!("'{}' joining from {} (version: {})", name, addr, client_version);

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Rejected {
                    reason: format!(
                        "Protocol version {} not supported, relay speaks {}",
                        client_version, PROTOCOL_VERSION
                    ),
                },
                addr,
            );
            return;
        }

        let participant_id = {
            let mut participants = self.participants.write().await;

            // A rejoin from the same address replaces the old session
            if let Some(existing_id) = participants.find_by_addr(addr) {
                info!("Replacing participant {} from {}", existing_id, addr);
                participants.remove_participant(&existing_id);
            }

            participants.add_participant(addr, name, elevated)
        };

        match participant_id {
            Some(participant_id) => {
                self.send_packet(
                    Packet::Joined {
                        participant_id,
                        server_time: get_timestamp(),
                        document: self.document.document().clone(),
                    },
                    addr,
                );
                self.broadcast_membership().await;
            }
            None => {
                self.send_packet(
                    Packet::Rejected {
                        reason: "Relay full".to_string(),
                    },
                    addr,
                );
            }
        }
    }

    fn save_document(&mut self) {
        match self.document.save() {
            Ok(true) => debug!("Scene document saved"),
            Ok(false) => {}
            Err(e) => error!("Failed to save scene document: {}", e),
        }
    }

    /// Main relay loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut save_interval = interval(self.save_interval);

        info!("Relay started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ParticipantTimeout { participant_id }) => {
                            info!("Participant {} timed out", participant_id);
                            self.broadcast_membership().await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Relay shutting down");
                            break;
                        }
                    }
                },

                _ = save_interval.tick() => {
                    self.save_document();
                },
            }
        }

        self.save_document();
        Ok(())
    }
}
