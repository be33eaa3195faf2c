//! Fan-out of emitted events to channel subscribers.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

/// Events queued per subscriber before it starts lagging.
const ROOM_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
/// One event published to a channel's subscribers.
pub enum RelayEvent {
    /// Encoded JPEG payload.
    Frame(Bytes),
    /// Detections accompanying the preceding frame.
    Detections(Value),
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Frame(_) => "frame",
            RelayEvent::Detections(_) => "detections",
        }
    }
}

/// Fire-and-forget multi-subscriber publish.
pub trait BroadcastTransport: Send + Sync {
    fn publish(&self, channel_id: &str, event: RelayEvent);
}

/// In-process rooms, one broadcast sender per channel id. Subscribers that
/// fall behind skip ahead to the newest events.
#[derive(Debug, Default)]
pub struct RoomHub {
    rooms: RwLock<HashMap<String, broadcast::Sender<RelayEvent>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the room for `channel_id`, creating it on first use.
    pub fn subscribe(&self, channel_id: &str) -> broadcast::Receiver<RelayEvent> {
        if let Some(sender) = self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
        {
            return sender.subscribe();
        }
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl BroadcastTransport for RoomHub {
    fn publish(&self, channel_id: &str, event: RelayEvent) {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = rooms.get(channel_id) {
            // No receivers is not an error for fire-and-forget delivery.
            let _ = sender.send(event);
        }
    }
}
