//! WebSocket message types.

use serde::{Deserialize, Serialize};

use super::hub::{HubEvent, Replay};
use crate::runner::LineEvent;
use crate::telemetry::TelemetrySample;

/// Events sent from server to client as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WsEvent {
    /// Sent once on connect: the transcript so far and recent telemetry.
    History {
        history: String,
        telemetry: Vec<TelemetrySample>,
    },

    /// One output line of a run.
    Line(LineEvent),

    /// One telemetry reading.
    Telemetry(TelemetrySample),

    /// The transcript was cleared; drop everything shown so far.
    TranscriptCleared,

    /// Heartbeat/keepalive ping.
    Ping,
}

impl From<Replay> for WsEvent {
    fn from(replay: Replay) -> Self {
        let mut history = replay.transcript.join("\n");
        if !history.is_empty() {
            history.push('\n');
        }
        WsEvent::History {
            history,
            telemetry: replay.telemetry,
        }
    }
}

impl From<HubEvent> for WsEvent {
    fn from(event: HubEvent) -> Self {
        match event {
            HubEvent::Line(line) => WsEvent::Line(line),
            HubEvent::Telemetry(sample) => WsEvent::Telemetry(sample),
            HubEvent::TranscriptCleared => WsEvent::TranscriptCleared,
        }
    }
}

/// Messages accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WsCommand {
    /// Reply to a server ping.
    Pong,
}
