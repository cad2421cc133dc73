use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::event::StepEvent;
use super::sink::{EventSink, StdOutSink};

/// Everything that travels over the bus channel.
///
/// Sinks are registered by message rather than held behind a shared lock:
/// the delivery worker owns them outright, and because the channel is
/// FIFO, a sink added before an event is guaranteed to see that event.
enum BusMessage {
    Event(StepEvent),
    AddSink(Box<dyn EventSink>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap cloneable handle producers use to emit events onto the bus.
///
/// Sending never blocks; if the bus is gone the event is discarded
/// (event delivery is best-effort by design).
#[derive(Clone)]
pub struct EventSender {
    tx: flume::Sender<BusMessage>,
}

impl EventSender {
    /// Emit an event. Returns `false` if the bus is gone.
    pub fn send(&self, event: StepEvent) -> bool {
        self.tx.send(BusMessage::Event(event)).is_ok()
    }

    /// A sender with no bus behind it; every send is discarded.
    ///
    /// Useful for tests and for running workflows without observability.
    #[must_use]
    pub fn disconnected() -> Self {
        let (tx, _rx) = flume::unbounded();
        Self { tx }
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

/// Receives workflow events and delivers them to registered sinks.
///
/// The bus is a small actor: one ingress channel, one delivery worker.
/// Producers hold [`EventSender`] clones; the worker drains the channel
/// in order and hands each event to every sink it owns. Delivery happens
/// on the worker task, so a slow sink never stalls workflow scheduling,
/// and a failing sink is logged and skipped rather than failing the run.
pub struct EventBus {
    tx: flume::Sender<BusMessage>,
    rx: flume::Receiver<BusMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    /// A bus with no sinks yet; add some and start the worker.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            worker: Mutex::new(None),
        }
    }

    /// A bus pre-loaded with a single sink.
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        let bus = Self::new();
        bus.add_sink(sink);
        bus
    }

    /// A bus pre-loaded with several sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        let bus = Self::new();
        for sink in sinks {
            let _ = bus.tx.send(BusMessage::AddSink(sink));
        }
        bus
    }

    /// Register another sink, before or after the worker starts.
    ///
    /// Registration rides the same channel as events, so the sink
    /// receives exactly the events enqueued after this call.
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        let _ = self.tx.send(BusMessage::AddSink(Box::new(sink)));
    }

    /// Get a clone of the sender side so producers can emit events.
    pub fn get_sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Start the delivery worker. Calling again while one is running has
    /// no effect; after [`stop_listener`](Self::stop_listener) it resumes
    /// from wherever the channel was left.
    pub fn listen_for_events(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        *worker = Some(tokio::spawn(deliver(self.rx.clone())));
    }

    /// Stop the delivery worker after it has drained everything enqueued
    /// so far.
    pub async fn stop_listener(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(BusMessage::Shutdown);
            let _ = handle.await;
        }
    }

    /// Wait until every event sent before this call has reached the
    /// sinks. Works by acknowledging a marker through the FIFO channel.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.abort();
        }
    }
}

/// Delivery loop: owns the sink list, drains the channel in order.
async fn deliver(rx: flume::Receiver<BusMessage>) {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    while let Ok(message) = rx.recv_async().await {
        match message {
            BusMessage::Event(event) => {
                for sink in &mut sinks {
                    if let Err(error) = sink.handle(&event) {
                        tracing::warn!(
                            target: "trellis::events",
                            %error,
                            event = %event,
                            "sink rejected event"
                        );
                    }
                }
            }
            BusMessage::AddSink(sink) => sinks.push(sink),
            BusMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            BusMessage::Shutdown => break,
        }
    }
}
