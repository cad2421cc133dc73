pub mod bus;
pub mod event;
pub mod sink;

pub use bus::{EventBus, EventSender};
pub use event::{
    EventData, EventType, StepEndData, StepEvent, StepStartData, TransitionData,
};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
