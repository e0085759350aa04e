//! Participant connection management for the relay
//!
//! This module tracks everyone connected to the relay:
//! - Participant lifecycle (join, leave, timeout)
//! - Address lookup for routing incoming datagrams to a participant
//! - The elevated flag that decides where authority requests go
//! - Capacity limits and membership snapshots for broadcasting
//!
//! The relay keeps no game state of its own; membership is the only thing
//! participants learn from it besides relayed payloads and document changes.

use log::info;
use shared::{ParticipantId, ParticipantInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Silence after which a participant is considered gone.
pub const PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(5);

/// A participant connected to the relay
///
/// Each participant carries:
/// - Connection metadata (ID, address, last activity)
/// - The display name used to match actor ownership
/// - Whether it is elevated and therefore applies shared side effects
#[derive(Debug)]
pub struct Participant {
    /// Unique participant identifier assigned by the relay
    pub id: ParticipantId,
    /// Network address for sending packets back
    pub addr: SocketAddr,
    /// Name matched against actor owner lists
    pub name: String,
    /// Elevated participants receive authority requests
    pub elevated: bool,
    /// Last time we received any packet from this participant
    pub last_seen: Instant,
}

impl Participant {
    /// Creates a participant marked as seen just now
    pub fn new(id: ParticipantId, addr: SocketAddr, name: String, elevated: bool) -> Self {
        Self {
            id,
            addr,
            name,
            elevated,
            last_seen: Instant::now(),
        }
    }

    /// Records activity from this participant
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing was received within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Public view of this participant as sent in membership updates
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo::new(self.id, self.name.clone(), self.elevated)
    }
}

/// Manages every participant connected to the relay
///
/// The ParticipantManager enforces the participant limit, hands out ids,
/// and answers the routing questions the relay asks for each packet: who
/// sent it, who should receive a broadcast, and who is elevated.
pub struct ParticipantManager {
    /// Connected participants indexed by their unique ID
    participants: HashMap<ParticipantId, Participant>,
    /// Next available participant ID
    next_participant_id: ParticipantId,
    /// Maximum number of concurrent participants allowed
    max_participants: usize,
    timeout: Duration,
}

impl ParticipantManager {
    /// Creates an empty manager with the given capacity
    ///
    /// Participant IDs start from 1 and increment for each join.
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            next_participant_id: 1,
            max_participants,
            timeout: PARTICIPANT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts to register a participant
    ///
    /// Returns Some(participant_id) on success, None if the relay is full.
    pub fn add_participant(&mut self, addr: SocketAddr, name: &str, elevated: bool) -> Option<ParticipantId> {
        if self.participants.len() >= self.max_participants {
            return None;
        }

        let participant_id = self.next_participant_id;
        self.next_participant_id += 1;

        info!(
            "Participant {} '{}' joined from {}{}",
            participant_id,
            name,
            addr,
            if elevated { " (elevated)" } else { "" }
        );
        self.participants.insert(
            participant_id,
            Participant::new(participant_id, addr, name.to_string(), elevated),
        );

        Some(participant_id)
    }

    /// Removes a participant. Returns false if they were already gone.
    pub fn remove_participant(&mut self, participant_id: &ParticipantId) -> bool {
        if let Some(participant) = self.participants.remove(participant_id) {
            info!("Participant {} '{}' left", participant.id, participant.name);
            true
        } else {
            false
        }
    }

    /// Finds a participant ID by network address
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ParticipantId> {
        self.participants
            .iter()
            .find(|(_, p)| p.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Marks the participant at `addr` as active and returns its ID
    pub fn touch(&mut self, addr: SocketAddr) -> Option<ParticipantId> {
        let participant = self.participants.values_mut().find(|p| p.addr == addr)?;
        participant.touch();
        Some(participant.id)
    }

    /// Removes participants that have gone silent
    ///
    /// Returns the removed IDs so the relay can announce the new membership.
    pub fn check_timeouts(&mut self) -> Vec<ParticipantId> {
        let timeout = self.timeout;
        let timed_out: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|(_, p)| p.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for participant_id in &timed_out {
            self.remove_participant(participant_id);
        }

        timed_out
    }

    /// All participant IDs and their addresses, for broadcasting
    pub fn addrs(&self) -> Vec<(ParticipantId, SocketAddr)> {
        self.participants
            .iter()
            .map(|(id, p)| (*id, p.addr))
            .collect()
    }

    /// Addresses of elevated participants, for authority-only routing
    pub fn authority_addrs(&self) -> Vec<(ParticipantId, SocketAddr)> {
        self.participants
            .iter()
            .filter(|(_, p)| p.elevated)
            .map(|(id, p)| (*id, p.addr))
            .collect()
    }

    /// Current membership ordered by ID
    pub fn membership(&self) -> Vec<ParticipantInfo> {
        let mut members: Vec<ParticipantInfo> = self.participants.values().map(Participant::info).collect();
        members.sort_by_key(|p| p.id);
        members
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
