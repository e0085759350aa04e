//! # Scene Participant Library
//!
//! A participant joins a scene through the relay and simulates the actors it
//! has authority over. Everything else it sees is a replica interpolated
//! from the snapshots other participants publish.
//!
//! ## Architecture Overview
//!
//! ### Authority
//! An actor is simulated by exactly one participant: its connected regular
//! owner with the lowest id, or failing that the lowest-id elevated
//! participant. Membership updates from the relay re-run that decision, so
//! authority moves between participants as they join and leave.
//!
//! ### Shared Document
//! The participant keeps a local mirror of the scene document. Its own
//! writes apply to the mirror immediately and are forwarded to the relay;
//! writes made by others arrive as change notifications and may reposition
//! actors when they land far from the simulated position.
//!
//! ### Shared Clock
//! Pings to the relay estimate the offset to the relay's clock. Every time
//! the simulation sees (hazard cycles, gate expiry, snapshot timestamps) is
//! shared time, so animated elements line up across participants.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The socket-free session: relay-backed store, packet outbox, packet
//! handling and the per-frame call into the simulation driver.
//!
//! ### Input Module (`input`)
//! Scripted and wandering input sources for the controlled actor.
//!
//! ### Network Module (`network`)
//! UDP link to the relay, frame and ping timers, artificial latency and
//! trigger event output.

pub mod game;
pub mod input;
pub mod network;
