//! Integration tests across relay, participant sessions and the simulation core
//!
//! These tests run a real relay on an ephemeral UDP port and talk to it
//! either with raw packets or through full participant sessions.

use bincode::{deserialize, serialize};
use client::game::{Session, SessionConfig};
use client::input::{IdleInput, InputSource, ScriptedInput};
use relay::{DocumentStore, RelayServer};
use shared::actor::Authority;
use shared::clock::get_timestamp;
use shared::events::{TriggerEvent, TriggerKind};
use shared::level::{ElementKind, LevelElement, PersistedActor, Rect};
use shared::{AuthorityRequest, Packet, ParticipantId, SceneDocument, StoreWrite, Topic, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

async fn start_relay(document: SceneDocument) -> SocketAddr {
    let mut server = RelayServer::new(
        "127.0.0.1:0",
        8,
        DocumentStore::new(document),
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    addr
}

fn scene() -> SceneDocument {
    SceneDocument {
        scene_id: "cave".into(),
        elements: vec![
            LevelElement::new("start", ElementKind::Start, Rect::new(50.0, 440.0, 50.0, 50.0)),
            LevelElement::new("floor", ElementKind::Platform, Rect::new(-1000.0, 500.0, 3000.0, 100.0)),
        ],
        ..Default::default()
    }
}

/// A participant speaking raw packets
struct RawParticipant {
    socket: UdpSocket,
    relay: SocketAddr,
}

impl RawParticipant {
    async fn new(relay: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            relay,
        }
    }

    async fn send(&self, packet: &Packet) {
        let data = serialize(packet).unwrap();
        assert_ok!(self.socket.send_to(&data, self.relay).await);
    }

    /// Next packet matching `pred`, skipping others, or None after `wait`
    async fn recv_matching<F>(&self, wait: Duration, pred: F) -> Option<Packet>
    where
        F: Fn(&Packet) -> bool,
    {
        let mut buf = vec![0u8; 65_536];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (len, _) = timeout(remaining, self.socket.recv_from(&mut buf)).await.ok()?.ok()?;
            let packet: Packet = deserialize(&buf[..len]).unwrap();
            if pred(&packet) {
                return Some(packet);
            }
        }
    }

    async fn expect<F>(&self, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        self.recv_matching(Duration::from_secs(2), pred)
            .await
            .expect("expected packet did not arrive")
    }

    async fn join(&self, name: &str, elevated: bool) -> (ParticipantId, SceneDocument) {
        self.send(&Packet::Join {
            client_version: PROTOCOL_VERSION,
            name: name.into(),
            elevated,
        })
        .await;

        match self.expect(|p| matches!(p, Packet::Joined { .. })).await {
            Packet::Joined {
                participant_id,
                document,
                ..
            } => (participant_id, document),
            _ => unreachable!(),
        }
    }
}

/// RELAY PROTOCOL TESTS
mod relay_protocol_tests {
    use super::*;

    #[tokio::test]
    async fn join_returns_document_and_membership() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;

        let (id, document) = alice.join("alice", false).await;
        assert_eq!(id, 1);
        assert_eq!(document.scene_id, "cave");

        match alice.expect(|p| matches!(p, Packet::Membership { .. })).await {
            Packet::Membership { participants } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].name, "alice");
                assert!(!participants[0].elevated);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_everyone_including_sender() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        let bob = RawParticipant::new(relay).await;
        let (alice_id, _) = alice.join("alice", false).await;
        bob.join("bob", false).await;

        let event = TriggerEvent {
            actor: "hero".into(),
            kind: TriggerKind::Death,
        };
        alice
            .send(&Packet::Publish {
                topic: Topic::Trigger(event.clone()),
            })
            .await;

        for participant in [&alice, &bob] {
            match participant.expect(|p| matches!(p, Packet::Delivered { .. })).await {
                Packet::Delivered { from, topic } => {
                    assert_eq!(from, alice_id);
                    assert_eq!(topic, Topic::Trigger(event.clone()));
                }
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn authority_requests_only_reach_elevated_participants() {
        let relay = start_relay(scene()).await;
        let gm = RawParticipant::new(relay).await;
        let alice = RawParticipant::new(relay).await;
        let bob = RawParticipant::new(relay).await;
        gm.join("gm", true).await;
        alice.join("alice", false).await;
        let (bob_id, _) = bob.join("bob", false).await;

        let request = AuthorityRequest::ConsumePickup { id: "gem".into() };
        bob.send(&Packet::ToAuthority {
            request: request.clone(),
        })
        .await;

        match gm.expect(|p| matches!(p, Packet::AuthorityRequest { .. })).await {
            Packet::AuthorityRequest { from, request: r } => {
                assert_eq!(from, bob_id);
                assert_eq!(r, request);
            }
            _ => unreachable!(),
        }

        let leaked = alice
            .recv_matching(Duration::from_millis(200), |p| matches!(p, Packet::AuthorityRequest { .. }))
            .await;
        assert!(leaked.is_none());
    }

    #[tokio::test]
    async fn authority_request_without_elevated_is_dropped() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        alice.join("alice", false).await;

        alice
            .send(&Packet::ToAuthority {
                request: AuthorityRequest::ResetCrumble { id: "tile".into() },
            })
            .await;

        let delivered = alice
            .recv_matching(Duration::from_millis(200), |p| matches!(p, Packet::AuthorityRequest { .. }))
            .await;
        assert!(delivered.is_none());
    }

    #[tokio::test]
    async fn store_writes_fan_out_to_everyone_but_the_writer() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        let bob = RawParticipant::new(relay).await;
        alice.join("alice", false).await;
        bob.join("bob", false).await;

        let write = StoreWrite::GateExpiry {
            id: "door".into(),
            expires_at: 12_345,
        };
        alice.send(&Packet::StoreWrite { write: write.clone() }).await;

        match bob.expect(|p| matches!(p, Packet::StoreChanged { .. })).await {
            Packet::StoreChanged { revision, write: w } => {
                assert_eq!(revision, 1);
                assert_eq!(w, write);
            }
            _ => unreachable!(),
        }

        let echoed = alice
            .recv_matching(Duration::from_millis(200), |p| matches!(p, Packet::StoreChanged { .. }))
            .await;
        assert!(echoed.is_none());

        // Late joiners see the write in the document
        let carol = RawParticipant::new(relay).await;
        let (_, document) = carol.join("carol", false).await;
        assert_eq!(document.active_gates.get("door"), Some(&12_345));
    }

    #[tokio::test]
    async fn ping_is_answered_with_relay_time() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        alice.join("alice", false).await;

        let sent_at = get_timestamp();
        alice.send(&Packet::Ping { sent_at }).await;

        match alice.expect(|p| matches!(p, Packet::Pong { .. })).await {
            Packet::Pong {
                sent_at: echoed,
                server_time,
            } => {
                assert_eq!(echoed, sent_at);
                assert!(server_time >= sent_at);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn leave_updates_membership() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        let bob = RawParticipant::new(relay).await;
        alice.join("alice", false).await;
        bob.join("bob", false).await;

        bob.send(&Packet::Leave).await;

        let membership = alice
            .expect(|p| matches!(p, Packet::Membership { participants } if participants.len() == 1))
            .await;
        match membership {
            Packet::Membership { participants } => assert_eq!(participants[0].name, "alice"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let relay = start_relay(scene()).await;
        let old = RawParticipant::new(relay).await;

        old.send(&Packet::Join {
            client_version: PROTOCOL_VERSION + 1,
            name: "old".into(),
            elevated: false,
        })
        .await;

        assert!(matches!(
            old.expect(|_| true).await,
            Packet::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn packets_before_join_are_rejected() {
        let relay = start_relay(scene()).await;
        let stranger = RawParticipant::new(relay).await;

        stranger.send(&Packet::Ping { sent_at: 1 }).await;

        assert!(matches!(
            stranger.expect(|_| true).await,
            Packet::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_datagrams_are_ignored() {
        let relay = start_relay(scene()).await;
        let alice = RawParticipant::new(relay).await;
        alice.join("alice", false).await;

        assert_ok!(alice.socket.send_to(&[0xff, 0x00, 0x13, 0x37], relay).await);
        alice.send(&Packet::Ping { sent_at: 7 }).await;

        assert!(matches!(
            alice.expect(|p| matches!(p, Packet::Pong { .. })).await,
            Packet::Pong { sent_at: 7, .. }
        ));
    }
}

/// A participant running a full session against the relay
struct Peer {
    session: Session,
    socket: UdpSocket,
    relay: SocketAddr,
}

impl Peer {
    async fn join(relay: SocketAddr, name: &str, elevated: bool, actor: Option<&str>, input: Box<dyn InputSource>) -> Self {
        let mut session = Session::new(
            SessionConfig {
                name: name.into(),
                elevated,
                actor: actor.map(|a| a.to_string()),
            },
            input,
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let join = session.join_packet(get_timestamp());
        let data = serialize(&join).unwrap();
        assert_ok!(socket.send_to(&data, relay).await);

        Self { session, socket, relay }
    }

    fn pump(&mut self) {
        let mut buf = vec![0u8; 65_536];
        while let Ok((len, _)) = self.socket.try_recv_from(&mut buf) {
            let packet: Packet = deserialize(&buf[..len]).unwrap();
            self.session.handle_packet(packet, get_timestamp());
        }
    }

    async fn frame(&mut self) {
        self.pump();
        self.session.frame(get_timestamp()).unwrap();
        for packet in self.session.outgoing() {
            let data = serialize(&packet).unwrap();
            assert_ok!(self.socket.send_to(&data, self.relay).await);
        }
    }

    fn authority_of(&self, actor: &str) -> Option<Authority> {
        self.session.simulation().controller(actor).map(|c| c.authority())
    }
}

async fn run_frames(peers: &mut [&mut Peer], frames: usize) {
    for _ in 0..frames {
        for peer in peers.iter_mut() {
            peer.frame().await;
        }
        sleep(Duration::from_millis(16)).await;
    }
}

fn owned_hero(mut document: SceneDocument) -> SceneDocument {
    let mut record = PersistedActor::new(50.0, 440.0, vec!["alice".into()]);
    record.width = 50.0;
    record.height = 50.0;
    document.actors.insert("hero".into(), record);
    document
}

/// END-TO-END SIMULATION TESTS
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn elevated_master_yields_to_connecting_owner() {
        let relay = start_relay(owned_hero(scene())).await;

        let mut gm = Peer::join(relay, "gm", true, None, Box::new(IdleInput)).await;
        run_frames(&mut [&mut gm], 10).await;
        assert_eq!(gm.authority_of("hero"), Some(Authority::Master));

        let mut alice = Peer::join(relay, "alice", false, Some("hero"), Box::new(IdleInput)).await;
        run_frames(&mut [&mut gm, &mut alice], 10).await;

        assert_eq!(gm.authority_of("hero"), Some(Authority::Replica));
        assert_eq!(alice.authority_of("hero"), Some(Authority::Master));
    }

    #[tokio::test]
    async fn replica_buffers_master_snapshots() {
        let relay = start_relay(owned_hero(scene())).await;

        let script: ScriptedInput = "0 right".parse().unwrap();
        let mut alice = Peer::join(relay, "alice", false, Some("hero"), Box::new(script)).await;
        let mut bob = Peer::join(relay, "bob", false, None, Box::new(IdleInput)).await;
        run_frames(&mut [&mut alice, &mut bob], 40).await;

        let hero = bob.session.simulation().controller("hero").unwrap();
        assert_eq!(hero.authority(), Authority::Replica);
        let latest = hero.buffer().latest().expect("replica received no snapshots");
        assert_eq!(latest.scene_id, "cave");
        assert!(latest.x > 50.0);

        // Alice's own snapshots are filtered out of her buffer
        let own = alice.session.simulation().controller("hero").unwrap();
        assert!(own.buffer().is_empty());
    }

    #[tokio::test]
    async fn plate_opens_gate_through_elevated_participant() {
        let mut document = owned_hero(scene());
        document.elements.push(LevelElement::new(
            "plate",
            ElementKind::PressurePlate {
                target: Some("door".into()),
                open_ms: 1000,
            },
            Rect::new(0.0, 490.0, 200.0, 10.0),
        ));
        document
            .elements
            .push(LevelElement::new("door", ElementKind::Gate, Rect::new(800.0, 300.0, 50.0, 200.0)));
        let relay = start_relay(document).await;

        let mut alice = Peer::join(relay, "alice", false, Some("hero"), Box::new(IdleInput)).await;
        run_frames(&mut [&mut alice], 20).await;
        assert_eq!(
            alice.session.simulation().controller("hero").unwrap().state.pressing_plate.as_deref(),
            Some("plate")
        );
        // Nobody elevated yet: the request is dropped
        assert!(alice.session.document().active_gates.is_empty());

        let mut gm = Peer::join(relay, "gm", true, None, Box::new(IdleInput)).await;
        run_frames(&mut [&mut alice, &mut gm], 40).await;

        assert!(gm.session.document().active_gates.contains_key("door"));
        assert!(alice.session.document().active_gates.contains_key("door"));
    }
}
