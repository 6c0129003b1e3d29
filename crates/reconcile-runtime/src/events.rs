//! Event recording.
//!
//! Reconcilers record events through the synchronous [`EventRecorder`]
//! trait and never wait on the API server: [`EventBroadcaster`] pushes
//! events into a bounded channel and a background task logs each one and
//! publishes it through an [`EventSink`] (normally [`KubeEventSink`]).

use crate::error::RuntimeError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    /// Informational
    Normal,
    /// Something needs attention
    Warning,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

impl From<EventSeverity> for EventType {
    fn from(severity: EventSeverity) -> Self {
        match severity {
            EventSeverity::Normal => Self::Normal,
            EventSeverity::Warning => Self::Warning,
        }
    }
}

/// An event attached to a subject object.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Object the event is about
    pub subject: ObjectReference,
    /// Normal or Warning
    pub severity: EventSeverity,
    /// Machine-readable reason code (e.g. `ErrResourceExists`)
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

/// Fire-and-forget event recording.
pub trait EventRecorder: Send + Sync {
    /// Record an event about `subject`. Must not block.
    fn record(&self, subject: &ObjectReference, severity: EventSeverity, reason: &str, message: &str);
}

/// Destination of recorded events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: &RecordedEvent) -> Result<(), RuntimeError>;
}

/// Publishes events to the cluster through `kube`'s event recorder.
#[derive(Clone)]
pub struct KubeEventSink {
    recorder: Recorder,
    action: String,
}

impl fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeEventSink")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl KubeEventSink {
    /// Events reported as coming from `component` (e.g. `sample-controller`).
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            action: "Reconciling".to_string(),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: &RecordedEvent) -> Result<(), RuntimeError> {
        let kube_event = Event {
            type_: event.severity.into(),
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: self.action.clone(),
            secondary: None,
        };
        self.recorder
            .publish(&kube_event, &event.subject)
            .await
            .map_err(|e| RuntimeError::Event(e.to_string()))
    }
}

/// Non-blocking recorder backed by a bounded channel and a publisher task.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: mpsc::Sender<RecordedEvent>,
}

impl EventBroadcaster {
    /// Starts the publisher task. It stops once `shutdown` fires, after
    /// flushing events already buffered.
    pub fn start(
        capacity: usize,
        sink: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RecordedEvent>(capacity.max(1));
        info!("Creating event broadcaster");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => publish(sink.as_ref(), &event).await,
                        None => break,
                    },
                    () = shutdown.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            publish(sink.as_ref(), &event).await;
                        }
                        break;
                    }
                }
            }
            info!("Event broadcaster stopped");
        });

        (Self { tx }, task)
    }
}

async fn publish(sink: &dyn EventSink, event: &RecordedEvent) {
    info!(
        "Event({}/{}): type: '{}' reason: '{}' {}",
        event.subject.namespace.as_deref().unwrap_or_default(),
        event.subject.name.as_deref().unwrap_or_default(),
        event.severity,
        event.reason,
        event.message
    );
    if let Err(e) = sink.publish(event).await {
        warn!("Failed to publish event {}: {}", event.reason, e);
    }
}

impl EventRecorder for EventBroadcaster {
    fn record(&self, subject: &ObjectReference, severity: EventSeverity, reason: &str, message: &str) {
        let event = RecordedEvent {
            subject: subject.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event buffer full, dropping event {}: {}", event.reason, event.message);
            }
            Err(TrySendError::Closed(event)) => {
                warn!("Event broadcaster stopped, dropping event {}", event.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<RecordedEvent>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn publish(&self, event: &RecordedEvent) -> Result<(), RuntimeError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn subject() -> ObjectReference {
        ObjectReference {
            kind: Some("Foo".to_string()),
            name: Some("example-foo".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_sink() {
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        let (broadcaster, task) = EventBroadcaster::start(8, sink.clone(), shutdown.clone());

        broadcaster.record(&subject(), EventSeverity::Warning, "ErrResourceExists", "taken");
        broadcaster.record(&subject(), EventSeverity::Normal, "Synced", "ok");
        shutdown.cancel();
        task.await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, EventSeverity::Warning);
        assert_eq!(events[0].reason, "ErrResourceExists");
        assert_eq!(events[1].reason, "Synced");
    }

    #[tokio::test]
    async fn test_record_never_blocks_when_buffer_full() {
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        // Publisher cannot run until this test yields
        let (broadcaster, task) = EventBroadcaster::start(1, sink.clone(), shutdown.clone());

        for _ in 0..10 {
            broadcaster.record(&subject(), EventSeverity::Normal, "Synced", "ok");
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }
}
