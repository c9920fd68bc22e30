use chrono::Utc;
use futures_util::Stream;
use hearth_core::{EventEnvelope, InferenceEvent};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::trace;

struct BusState {
    sequence: u64,
}

/// Fan-out event feed. Every subscriber gets its own bounded queue; a
/// subscriber that falls behind loses its oldest events and publishers never
/// wait on it.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state: Arc::new(Mutex::new(BusState { sequence: 0 })),
        }
    }

    /// Stamps and sends one event, returning its sequence number.
    pub fn publish(&self, event: InferenceEvent) -> u64 {
        // sequence assignment and send happen under one lock so the feed order
        // matches the numbering
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sequence += 1;
        let sequence = state.sequence;
        let envelope = EventEnvelope {
            sequence,
            timestamp: Utc::now(),
            event,
        };
        if self.sender.send(envelope).is_err() {
            trace!(sequence, "Event published with no subscribers");
        }
        sequence
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One subscriber's view of the feed.
pub struct EventSubscription {
    receiver: broadcast::Receiver<EventEnvelope>,
    missed: u64,
}

impl EventSubscription {
    /// Next event, skipping past anything dropped while this subscriber lagged.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(n)) => self.missed += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(n)) => self.missed += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains everything currently queued.
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Events this subscriber lost to overflow so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.receiver),
            missed: self.missed,
        }
    }
}

/// [`Stream`] adapter over a subscription.
pub struct EventStream {
    inner: BroadcastStream<EventEnvelope>,
    missed: u64,
}

impl EventStream {
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

impl Stream for EventStream {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(envelope))) => return Poll::Ready(Some(envelope)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => self.missed += n,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
