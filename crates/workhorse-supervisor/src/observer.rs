//! Observer broadcast.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{trace, warn};
use workhorse_core::SupervisorEvent;

/// Sending side of the observer channel.
///
/// Emitting never blocks and never fails: with no observers the event is
/// dropped, and a slow observer loses the oldest events instead of stalling
/// the supervisor.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SupervisorEvent) {
        trace!(?event, "Emitting event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}

/// Run `observer` for every event received on `rx` until the channel closes.
pub fn spawn_observer<F>(rx: broadcast::Receiver<SupervisorEvent>, mut observer: F) -> JoinHandle<()>
where
    F: FnMut(SupervisorEvent) + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(rx);
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => observer(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer fell behind, events dropped");
                }
            }
        }
    })
}
