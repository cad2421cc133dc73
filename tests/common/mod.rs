#![allow(dead_code)]

use trellis::events::{EventBus, EventData, MemorySink, StepEvent};

/// An event bus capturing everything into a memory sink, listener started.
pub fn memory_bus() -> (EventBus, MemorySink) {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen_for_events();
    (bus, sink)
}

/// Number of captured events with the given wire tag.
pub fn count_of(events: &[StepEvent], tag: &str) -> usize {
    events
        .iter()
        .filter(|event| event.event_type.as_str() == tag)
        .count()
}

/// First captured event with the given wire tag.
pub fn first_of<'a>(events: &'a [StepEvent], tag: &str) -> &'a StepEvent {
    events
        .iter()
        .find(|event| event.event_type.as_str() == tag)
        .unwrap_or_else(|| panic!("no {tag} event captured"))
}

/// The `parent_step` recorded in a start event's payload.
pub fn parent_step_of(event: &StepEvent) -> Option<trellis::StepId> {
    match &event.data {
        EventData::Start(data) => data.parent_step.clone(),
        other => panic!("expected start data, got {other:?}"),
    }
}

/// Every `*_start` event must pair with exactly one terminal event
/// carrying the same run and step ids, and times must be ordered.
pub fn assert_lifecycles_paired(events: &[StepEvent]) {
    for start in events.iter().filter(|event| event.event_type.is_start()) {
        let terminals: Vec<&StepEvent> = events
            .iter()
            .filter(|event| {
                event.event_type.is_terminal()
                    && event.step == start.step
                    && event.run_id == start.run_id
            })
            .collect();
        assert_eq!(
            terminals.len(),
            1,
            "step {} ({}) should have exactly one terminal event, found {}",
            start.step,
            start.event_type,
            terminals.len()
        );
        let end_time = terminals[0]
            .end_time
            .expect("terminal events carry an end time");
        assert!(
            start.start_time <= end_time,
            "step {} ends before it starts",
            start.step
        );
    }
}
