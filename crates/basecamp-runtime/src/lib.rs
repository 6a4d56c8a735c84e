//! basecamp-runtime — service lifecycle, task registry, mode dispatch, and
//! the release bundle builder.

pub mod build;
pub mod modes;
pub mod service;
pub mod svcctl;
pub mod tasks;

pub use build::{BuildError, Builder};
pub use modes::{Launcher, Mode};
pub use service::{Service, ServiceHost, Status};
pub use tasks::TaskRegistry;
