//! Queue-backed job submission with automatic resubmission after preemption.

pub mod controller;
pub mod types;

pub use controller::JobController;
pub use types::AttemptState;
pub use types::JobAttempt;
pub use types::JobEvent;
pub use types::JobRequest;
pub use types::JobStatus;
pub use types::JobTransition;
pub use types::ResubmitPolicy;
pub use types::TrackedJob;
