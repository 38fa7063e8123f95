//! Broadcast hub with replay for late subscribers.

use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::runner::LineEvent;
use crate::telemetry::{TelemetryHistory, TelemetrySample};
use crate::transcript::{TranscriptResult, TranscriptStore};

/// Size of the per-subscriber delivery buffer.
pub const SUBSCRIBER_BUFFER_SIZE: usize = 1024;

/// Events delivered to live subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Line(LineEvent),
    Telemetry(TelemetrySample),
    TranscriptCleared,
}

/// History handed to a subscriber when it attaches.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub transcript: Vec<String>,
    pub telemetry: Vec<TelemetrySample>,
}

/// A registered observer.
///
/// `replay` covers everything published before the subscription, `receiver`
/// everything after it.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub replay: Replay,
    pub receiver: mpsc::Receiver<HubEvent>,
}

/// Fans out run output and telemetry to any number of subscribers.
///
/// Recording an event into history, delivering it, and snapshotting history
/// for a new subscriber all happen under one lock. A subscriber therefore
/// sees each event exactly once: either in its replay or on its channel.
///
/// Delivery never blocks publishers. A subscriber whose buffer is full is
/// dropped; its receiver then ends and the client reconnects for a fresh
/// replay.
///
/// The lock is also held across the transcript append, which is blocking
/// file I/O. Line publishers call [`BroadcastHub::publish`] from the blocking
/// pool, so a slow disk delays other publishers and new subscribers but never
/// parks an async worker for long.
pub struct BroadcastHub {
    transcript: Arc<TranscriptStore>,
    telemetry: Arc<TelemetryHistory>,
    buffer_size: usize,
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<HubEvent>>,
}

impl BroadcastHub {
    pub fn new(transcript: Arc<TranscriptStore>, telemetry: Arc<TelemetryHistory>) -> Self {
        Self::with_buffer_size(transcript, telemetry, SUBSCRIBER_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        transcript: Arc<TranscriptStore>,
        telemetry: Arc<TelemetryHistory>,
        buffer_size: usize,
    ) -> Self {
        Self {
            transcript,
            telemetry,
            buffer_size: buffer_size.max(1),
            inner: Mutex::new(HubInner::default()),
        }
    }

    pub fn transcript(&self) -> &Arc<TranscriptStore> {
        &self.transcript
    }

    pub fn telemetry(&self) -> &Arc<TelemetryHistory> {
        &self.telemetry
    }

    /// Register a subscriber and return its replay and live channel.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let mut inner = self.lock();

        let replay = Replay {
            transcript: self.transcript.replay(),
            telemetry: self.telemetry.snapshot(),
        };
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        info!(
            "Subscriber {} attached ({} transcript records replayed)",
            id,
            replay.transcript.len()
        );

        Subscription {
            id,
            replay,
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            info!("Subscriber {} detached", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Record an event into history and deliver it to every subscriber.
    ///
    /// A transcript write failure is logged; live delivery still happens.
    pub fn publish(&self, event: HubEvent) {
        let mut inner = self.lock();
        match &event {
            HubEvent::Line(line) => {
                if let Err(e) = self.transcript.append(&line.text) {
                    error!("Failed to persist line {} of run {}: {}", line.seq, line.run_id, e);
                }
            }
            HubEvent::Telemetry(sample) => self.telemetry.push(sample.clone()),
            HubEvent::TranscriptCleared => {}
        }
        fan_out(&mut inner, &event);
    }

    /// Empty the transcript and tell live subscribers to reset their view.
    pub fn clear_transcript(&self) -> TranscriptResult<()> {
        let mut inner = self.lock();
        self.transcript.clear()?;
        fan_out(&mut inner, &HubEvent::TranscriptCleared);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn fan_out(inner: &mut HubInner, event: &HubEvent) {
    inner.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            info!("Dropping subscriber {}: delivery buffer full", id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Dropping subscriber {}: receiver closed", id);
            false
        }
    });
}
