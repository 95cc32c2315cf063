//! Task lifecycle: states, transition table, and the machine that enforces
//! it and notifies subscribers (§4.4).

mod machine;
mod state;

pub use machine::{TaskEvent, TaskStateMachine, TaskStatus, TransitionError};
pub use state::TaskState;
