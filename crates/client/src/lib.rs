// flowpresence-client: presence state machine for flow editor clients.
//
// The store and controller are synchronous and transport-agnostic; the
// `connection` module adapts them to a WebSocket connection to the relay.

pub mod connection;
pub mod controller;
pub mod error;
pub mod store;

pub use connection::{Connection, ConnectionEvent};
pub use controller::{ControllerEvent, JoinLeaveController, JoinOutcome, JoinState};
pub use error::PresenceError;
pub use store::{NodePresence, PeerInfo, PresenceChange, PresenceSlot, PresenceStore};
