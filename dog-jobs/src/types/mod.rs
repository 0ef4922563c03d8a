pub mod ids;
pub mod options;
pub mod record;
pub mod priority;
pub mod events;

pub use ids::JobId;
pub use options::JobOptions;
pub use record::{FailureKind, JobFailure, JobRecord, JobStatus};
pub use priority::JobPriority;
pub use events::JobEvent;
