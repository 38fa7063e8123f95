//! Live fan-out of run output and telemetry.
//!
//! [`BroadcastHub`] is the in-process fan-out; the WebSocket handler is its
//! network transport.

mod handler;
pub mod hub;
pub mod types;

pub use handler::ws_handler;
pub use hub::{BroadcastHub, HubEvent, Replay, Subscription};
pub use types::{WsCommand, WsEvent};
