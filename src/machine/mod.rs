pub mod definition;
pub mod runner;

pub use definition::{
    Guard, GuardArgs, MachineConfig, MachineError, MachineEvent, StateConfig, StateInput,
    TransitionCandidate, TransitionSpec, TransitionTable,
};
pub use runner::{
    run_machine, CurrentState, MachineStatus, SendOutcome, StateMachineRunner,
};
