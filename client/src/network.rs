use crate::game::{event_line, Session};
use bincode::{deserialize, serialize};
use log::{error, info, warn};
use shared::clock::get_timestamp;
use shared::Packet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

/// Join replies carry the whole scene document.
const MAX_DATAGRAM: usize = 65_507;

/// How trigger events leave the participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutput {
    /// `info!` log records
    Log,
    /// One JSON object per line on stdout
    JsonLines,
}

pub struct Client {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    session: Session,

    fake_ping_ms: u64,
    frame_duration: Duration,
    events: EventOutput,
}

impl Client {
    pub async fn new(
        relay_addr: &str,
        session: Session,
        fake_ping_ms: u64,
        fps: u32,
        events: EventOutput,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let relay_addr = relay_addr.parse()?;

        Ok(Client {
            socket,
            relay_addr,
            session,
            fake_ping_ms,
            frame_duration: Duration::from_millis(1000 / u64::from(fps.max(1))),
            events,
        })
    }

    async fn join(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Joining relay at {}...", self.relay_addr);

        let packet = self.session.join_packet(get_timestamp());
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.relay_addr).await?;
        Ok(())
    }

    /// Sends everything the session queued this frame
    async fn flush(&mut self) {
        for packet in self.session.outgoing() {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    fn emit_events(&mut self, local_ms: u64, events: Vec<shared::events::TriggerEvent>) {
        let now = self.session.shared_time(local_ms);
        for event in events {
            match self.events {
                EventOutput::Log => info!("{} fired {}", event.actor, event.kind.name()),
                EventOutput::JsonLines => match event_line(now, &event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode trigger event: {}", e),
                },
            }
        }
    }

    fn log_status(&mut self) {
        let local_ms = get_timestamp();
        for (actor, p) in self.session.presentations(local_ms) {
            info!(
                "{}: ({:.0}, {:.0}) hp {}/{}{}",
                actor,
                p.x,
                p.y,
                p.health,
                p.max_health,
                if p.dead { " dead" } else { "" }
            );
        }
        info!("Round trip {} ms", self.session.round_trip_ms());
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.join().await?;

        let mut frame_interval = interval(self.frame_duration);
        let mut ping_interval = interval(Duration::from_secs(1));
        let mut status_interval = interval(Duration::from_secs(5));

        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.session.handle_packet(packet, get_timestamp()),
                                Err(e) => warn!("Failed to deserialize packet: {}", e),
                            }

                            if let Some(reason) = self.session.rejection() {
                                error!("Leaving: {}", reason);
                                break;
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = frame_interval.tick() => {
                    let local_ms = get_timestamp();
                    match self.session.frame(local_ms) {
                        Ok(events) => self.emit_events(local_ms, events),
                        Err(e) => {
                            error!("Simulation stopped: {}", e);
                            break;
                        }
                    }
                    self.flush().await;
                },

                _ = ping_interval.tick() => {
                    if self.session.is_joined() {
                        let packet = Packet::Ping { sent_at: get_timestamp() };
                        if let Err(e) = self.send_packet(&packet).await {
                            error!("Error sending ping: {}", e);
                        }
                    } else {
                        self.join().await?;
                    }
                },

                _ = status_interval.tick() => {
                    self.log_status();
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received");
                    break;
                },
            }
        }

        if self.session.is_joined() {
            self.flush().await;
            let _ = self.send_packet(&Packet::Leave).await;
        }

        Ok(())
    }
}
