//! Job records, processing parameters and the lifecycle state machine.

pub mod job;
pub mod params;
pub mod state;

pub use job::{Job, JobStatus, JobUpdate, JobView};
pub use params::{JobParams, SeparationModel};
pub use state::{next, FailureKind, JobEvent, JobState, Phase, Transition};
