//! # Scene Relay Library
//!
//! The relay is the only thing participants of a scene talk to. It runs no
//! physics and owns no actors; every participant simulates the actors it has
//! authority over and the relay moves their messages around.
//!
//! ## Core Responsibilities
//!
//! ### Pub/Sub Fan-Out
//! `Publish` packets (actor snapshots and trigger events) are delivered to
//! every joined participant, the sender included. Participants filter out
//! their own messages.
//!
//! ### Authority Routing
//! `ToAuthority` packets carry side effects a regular participant may not
//! apply itself: consuming a pickup, collapsing a crumbling tile, opening a
//! gate. They are forwarded to elevated participants only. Requests arriving
//! while no elevated participant is connected are dropped with a warning.
//!
//! ### Shared Scene Document
//! The relay keeps the persisted scene record. Writes are applied last
//! writer wins and fanned out as `StoreChanged` to everyone except the
//! writer. The document is periodically saved as JSON so a restarted relay
//! resumes where it left off.
//!
//! ### Membership
//! Joins, leaves and timeouts are announced as a `Membership` packet listing
//! every connected participant. Participants derive actor authority from it.
//!
//! ## Module Organization
//!
//! ### Participant Manager (`participant_manager`)
//! Connection tracking, id assignment, timeout detection and the elevated
//! flag used for authority routing.
//!
//! ### Document (`document`)
//! The scene document with its revision counter and JSON persistence.
//!
//! ### Network (`network`)
//! UDP socket tasks and the single-threaded routing loop.

pub mod document;
pub mod network;
pub mod participant_manager;

pub use document::DocumentStore;
pub use network::RelayServer;
