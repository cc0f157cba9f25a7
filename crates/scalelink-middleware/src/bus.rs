//! Topic-based publish/subscribe delivery bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message without any single subscriber blocking the others.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Readings`] | Normalised [`ScaleReading`]s |
//! | [`Topic::Status`] | [`ConnectionStatus`] changes |
//!
//! There is no replay: a subscriber only sees events published after it
//! subscribed.  Late subscribers ask the Connection Manager for the current
//! status instead.

use scalelink_types::{ConnectionStatus, Event, EventPayload, ScaleError, ScaleReading};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events buffered per topic before the oldest are dropped for slow
/// subscribers.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Readings,
    Status,
}

impl Topic {
    /// The topic an event payload belongs on.
    pub fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::Reading(_) => Topic::Readings,
            EventPayload::StatusChanged(_) => Topic::Status,
        }
    }
}

/// Shared event bus.  Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    readings: broadcast::Sender<Event>,
    status: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` applies to each topic independently.
    pub fn new(capacity: usize) -> Self {
        let (readings, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        Self { readings, status }
    }

    /// Publish on the topic matching the event's payload.
    ///
    /// Returns the number of receivers handed the event.  With nobody
    /// listening this is a [`ScaleError::Channel`]; publishers treat that as
    /// best effort and ignore it.
    pub fn publish(&self, event: Event) -> Result<usize, ScaleError> {
        let topic = Topic::of(&event.payload);
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| ScaleError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            receiver: self.topic_sender(topic).subscribe(),
        }
    }


    /// Call `callback` for every reading published from now on.
    ///
    /// The callback runs on its own task and sees readings in arrival order.
    /// Must be called from within a Tokio runtime.
    pub fn on_reading<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ScaleReading) + Send + Sync + 'static,
    {
        self.observe(Topic::Readings, move |payload| {
            if let EventPayload::Reading(reading) = payload {
                callback(reading);
            }
        })
    }

    /// Call `callback` for every status change published from now on.
    pub fn on_status_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.observe(Topic::Status, move |payload| {
            if let EventPayload::StatusChanged(status) = payload {
                callback(status);
            }
        })
    }

    fn observe<F>(&self, topic: Topic, deliver: F) -> Subscription
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        // Subscribe before spawning so nothing published after this call
        // returns can be missed.
        let mut rx = self.subscribe_to(topic);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => deliver(event.payload),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(?topic, lagged_by = n, "subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(?topic, "subscription ended");
        });
        Subscription { task: Some(task) }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Readings => &self.readings,
            Topic::Status => &self.status,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// Async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event on this topic.
    ///
    /// `Lagged(n)` means `n` events were dropped because this receiver fell
    /// behind; `Closed` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}

/// Handle for an `on_*` observer.  Delivery stops when it is cancelled or
/// dropped.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scalelink_types::ConnectionState;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn reading_event(weight: f64) -> Event {
        Event::new(
            "scalelink-middleware::test",
            EventPayload::Reading(ScaleReading {
                weight,
                visual_id: None,
                electronic_id: None,
                stable: true,
                timestamp: Utc::now(),
                source_raw: format!("[{weight}]"),
            }),
        )
    }

    fn status_event(state: ConnectionState) -> Event {
        Event::new(
            "scalelink-middleware::test",
            EventPayload::StatusChanged(ConnectionStatus {
                state,
                ..ConnectionStatus::default()
            }),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::Readings);
        let mut b = bus.subscribe_to(Topic::Readings);

        let event = reading_event(300.0);
        assert_eq!(bus.publish(event.clone())?, 2);

        assert_eq!(a.recv().await?.id, event.id);
        assert_eq!(b.recv().await?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_a_channel_error() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.publish(reading_event(1.0)),
            Err(ScaleError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut status_rx = bus.subscribe_to(Topic::Status);
        let _readings_rx = bus.subscribe_to(Topic::Readings);

        bus.publish(reading_event(10.0))?;
        let result = tokio::time::timeout(Duration::from_millis(50), status_rx.recv()).await;
        assert!(result.is_err(), "status subscriber must not see readings");
        Ok(())
    }

    #[tokio::test]
    async fn observers_see_events_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on_reading(move |r| sink.lock().expect("lock").push(r.weight));

        for w in [1.0, 2.0, 3.0] {
            let _ = bus.publish(reading_event(w));
        }
        settle().await;
        assert_eq!(*seen.lock().expect("lock"), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let bus = EventBus::default();
        let _early = bus.subscribe_to(Topic::Status);
        let _ = bus.publish(status_event(ConnectionState::Connecting));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on_status_changed(move |s| sink.lock().expect("lock").push(s.state));
        settle().await;
        assert!(seen.lock().expect("lock").is_empty());

        let _ = bus.publish(status_event(ConnectionState::Connected));
        settle().await;
        assert_eq!(*seen.lock().expect("lock"), vec![ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let mut sub = bus.on_reading(move |_| *sink.lock().expect("lock") += 1);
        assert!(sub.is_active());

        let _ = bus.publish(reading_event(5.0));
        settle().await;
        sub.cancel();
        assert!(!sub.is_active());
        settle().await;

        assert!(bus.publish(reading_event(6.0)).is_err(), "no receivers left");
        assert_eq!(*seen.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn slow_receiver_reports_lag() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Readings);
        for i in 0..200 {
            let _ = bus.publish(reading_event(i as f64 + 1.0));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
