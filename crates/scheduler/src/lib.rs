//! Persistent schedules with recurrence, and the fire loop that delivers them.
//!
//! A schedule is either a pre-composed `message` or an LLM `prompt` whose
//! response becomes the delivery text.  Delivery is at-least-once: anything
//! that fails stays `pending` and the next 30-second tick retries it.

mod recurrence;
mod runner;
mod store;

pub use recurrence::{RepeatRule, compute_next};
pub use runner::{PromptRunner, SCHEDULER_TICK, SchedulerLoop};
pub use store::{NewSchedule, Schedule, ScheduleError, ScheduleStatus, ScheduleStore};
