//! # Event Bus
//!
//! Fire-and-forget notifications for command lifecycle, SSH pool activity, cache
//! hits, temp-resource creation, and file transfers (§4.11). Grounded on the pack's
//! `callback_system::CallbackSender` trait and `ProgressUpdate` enum: an async trait
//! receiving a tagged event enum, with a channel-backed and a logging implementation
//! provided out of the box.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A single notable occurrence inside the engine.
#[derive(Debug, Clone)]
pub enum Event {
    CommandStart { command_line: String, adapter: String },
    CommandComplete { command_line: String, adapter: String, duration: Duration, ok: bool },
    CommandError { command_line: String, adapter: String, reason: String },
    SshConnect { host: String },
    SshDisconnect { host: String },
    SshReconnect { host: String, attempt: u32 },
    SshPoolCleanup { host: String, evicted: usize },
    SshPoolMetrics { active: usize, idle: usize },
    CacheHit { key: String },
    CacheMiss { key: String },
    CacheStore { key: String },
    TempCreate { path: String },
    TempCleanup { path: String },
    FileRead { path: String },
    FileWrite { path: String },
}

/// Receives [`Event`]s published by the engine.
///
/// Mirrors the pack's callback trait: one method to deliver an event, implementors
/// choose whether that means forwarding over a channel, logging, or discarding.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: Event);
}

/// Broadcasts events to every registered subscriber. Subscribers are notified
/// sequentially; a slow or panicking subscriber does not block event delivery to
/// the others since each call is isolated, but it can slow down the publishing
/// caller — keep subscriber implementations cheap.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().expect("event bus lock poisoned").push(subscriber);
    }

    pub async fn publish(&self, event: Event) {
        let subscribers: Vec<_> = self.subscribers.read().expect("event bus lock poisoned").clone();
        for subscriber in subscribers {
            subscriber.on_event(event.clone()).await;
        }
    }
}

/// Forwards every event onto an unbounded channel. The receiving half is dropped
/// silently if the caller never reads it; sends never block.
pub struct ChannelEventSubscriber {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSubscriber for ChannelEventSubscriber {
    async fn on_event(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

/// Emits every event as a `tracing::debug!` line. Useful as the default subscriber
/// when the caller hasn't registered anything else.
pub struct LoggingEventSubscriber;

#[async_trait]
impl EventSubscriber for LoggingEventSubscriber {
    async fn on_event(&self, event: Event) {
        tracing::debug!(?event, "engine event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_every_subscriber() {
        let bus = EventBus::new();
        let (channel_sub, mut receiver) = ChannelEventSubscriber::new();
        bus.subscribe(Arc::new(channel_sub));
        bus.subscribe(Arc::new(LoggingEventSubscriber));

        bus.publish(Event::CommandStart {
            command_line: "echo hi".to_string(),
            adapter: "local".to_string(),
        })
        .await;

        let received = receiver.recv().await.expect("channel subscriber should receive the event");
        assert!(matches!(received, Event::CommandStart { .. }));
    }

    #[tokio::test]
    async fn bus_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::CacheHit { key: "k".to_string() }).await;
    }
}
