use parking_lot::Mutex;
use std::io::{self, Result as IoResult, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::event::StepEvent;

/// An output target for [`StepEvent`]s.
///
/// The bus worker owns its sinks and calls them sequentially, so
/// implementations need no internal synchronisation of their own unless
/// they are also read from outside the bus (as [`MemorySink`] is). A
/// returned error drops that one event for that one sink; it never fails
/// the workflow.
pub trait EventSink: Send + Sync {
    /// Consume one structured event.
    fn handle(&mut self, event: &StepEvent) -> IoResult<()>;
}

/// Writes one line per event to stdout.
///
/// The default rendering is the event's compact `Display` form; use
/// [`StdOutSink::json`] to log full JSON documents instead.
#[derive(Default)]
pub struct StdOutSink {
    json: bool,
}

impl StdOutSink {
    /// A sink that writes each event as one JSON document per line.
    #[must_use]
    pub fn json() -> Self {
        Self { json: true }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &StepEvent) -> IoResult<()> {
        let mut out = io::stdout().lock();
        if self.json {
            let rendered = serde_json::to_string(event)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writeln!(out, "{rendered}")?;
        } else {
            writeln!(out, "{event}")?;
        }
        out.flush()
    }
}

/// Accumulates events in memory; the test suites assert against it.
///
/// Clones share the same buffer, so one clone can sit on the bus while
/// another inspects what arrived.
#[derive(Clone, Default)]
pub struct MemorySink {
    captured: Arc<Mutex<Vec<StepEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StepEvent> {
        self.captured.lock().clone()
    }

    /// Remove and return everything captured so far.
    #[must_use]
    pub fn take(&self) -> Vec<StepEvent> {
        std::mem::take(&mut *self.captured.lock())
    }

    /// Number of events captured so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.captured.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &StepEvent) -> IoResult<()> {
        self.captured.lock().push(event.clone());
        Ok(())
    }
}

/// Forwards events into a tokio channel for an async consumer — an SSE
/// endpoint, a live dashboard, a persistence task.
///
/// Sending is non-blocking; once the receiving side is dropped the sink
/// reports broken-pipe and the bus stops bothering it.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StepEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<StepEvent>) -> Self {
        Self { tx }
    }

    /// Build the sink together with its consuming end.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<StepEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &StepEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event receiver closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::{EventData, EventType};
    use crate::types::{RunId, StepId};
    use chrono::Utc;
    use serde_json::json;

    fn event() -> StepEvent {
        StepEvent {
            event_type: EventType::from_tag("custom:ping"),
            run_id: RunId::new(),
            step: StepId::new(),
            source: "test".into(),
            source_node: String::new(),
            start_time: Utc::now(),
            end_time: None,
            data: EventData::User(json!(1)),
            meta: None,
        }
    }

    #[test]
    fn test_memory_sink_clones_share_the_buffer() {
        let sink = MemorySink::new();
        let mut on_bus = sink.clone();
        on_bus.handle(&event()).unwrap();
        on_bus.handle(&event()).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_reports_closure() {
        let (mut sink, mut rx) = ChannelSink::pair();
        sink.handle(&event()).unwrap();
        assert!(rx.recv().await.is_some());

        drop(rx);
        assert!(sink.handle(&event()).is_err());
    }
}
