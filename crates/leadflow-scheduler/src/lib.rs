//! # Leadflow Scheduler
//!
//! Orchestration core of the lead workers: the lifecycle controller wrapping
//! every step, the retry policy, the slot search used for bookings, and the
//! SQLite store and queue the workers run against.
//!
//! ## Architecture
//! ```text
//! SqliteQueue (per-kind, leased deliveries)
//!   └── WorkerPool: N workers × 4 step kinds
//!         └── TaskLifecycleController
//!               ├── before_start  → lead Running @ node
//!               ├── StepExecutor  (aiCall | preVerify | googleCalendar | sendWebhook)
//!               ├── on_success    → Advancing | Finished
//!               └── on_failure    → RetryPolicy → reschedule | Failed
//!
//! FlowLauncher::publish → SqliteQueue   (starts / advances leads)
//! ```

pub mod lifecycle;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod slots;
pub mod worker;
pub mod workflow;

pub use lifecycle::{TaskLifecycleController, TaskOutcome};
pub use persistence::SqliteStore;
pub use queue::{Delivery, SqliteQueue};
pub use retry::RetryPolicy;
pub use slots::{WorkingWindow, find_nearest_slot};
pub use worker::WorkerPool;
pub use workflow::{FlowLauncher, has_successor, status_after_success};
