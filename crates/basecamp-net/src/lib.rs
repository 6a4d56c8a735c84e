//! basecamp-net — framed TCP transport, serial-addressed endpoints, and the
//! command dispatcher built on top of them.

pub mod commander;
pub mod endpoint;
pub mod frame;

mod connection;

pub use commander::{CommandError, Commander};
pub use endpoint::{Endpoint, NetError};
pub use frame::FrameError;
