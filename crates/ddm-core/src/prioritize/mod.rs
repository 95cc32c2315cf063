//! Queue prioritization: eight weighted factors combined into one score,
//! with bounded adaptive weight learning (§4.7).

mod engine;
mod factors;
mod queue;

pub use engine::{PriorityScore, PrioritizationEngine, Weights};
pub use factors::{FactorScores, TaskFactorInputs};
pub use queue::{QueueScheduler, ResourceLoad, SchedulingStrategy};
