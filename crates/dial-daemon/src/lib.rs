//! fmdial daemon: tunes internet radio streams by simulated FM frequency.

pub mod cache;
pub mod catalog;
pub mod core;
pub mod engine;
pub mod icy;
pub mod latency;
pub mod logging;
pub mod mpv;
pub mod playlist;
pub mod session;
pub mod socket;
pub mod state;
pub mod store;

/// Fan-out notifications from the controller (and the log layer) to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    StateUpdated,
    TitleUpdated(Option<String>),
    Log(String),
}
