//! Execution scheduler (C7 graph levelization lives in [`crate::model::plan`],
//! C8 scheduler, C9 classified backoff, C10 event/run surface).

pub mod backoff;
pub mod events;
pub mod executor;
pub mod run_store;

pub use events::{Event, EventLevel, EventPublisher, EventType, RecordingEventPublisher, TracingEventPublisher};
pub use executor::{ProviderDispatch, ScheduleOptions, Scheduler};
pub use run_store::{InMemoryRunStore, RunStore};
