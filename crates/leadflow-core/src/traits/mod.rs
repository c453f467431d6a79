//! Collaborator boundaries: stores, dispatcher and step executors.

pub mod dispatch;
pub mod step;
pub mod store;

pub use dispatch::Dispatcher;
pub use step::{StepExecutor, StepRegistry};
pub use store::{FlowGraphStore, LeadStateStore, UserStore};
