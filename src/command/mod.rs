//! Device commands through the backend.
//!
//! [`CommandDispatcher`] wraps a [`CommandBackend`] (HTTP by default) and
//! exposes one method per device operation, tracking loading, last error
//! and last response as observable state.

mod backend;
mod dispatcher;
mod envelope;
mod history;

pub use backend::{CommandBackend, HttpCommandBackend};
pub use dispatcher::{
    CommandDispatcher, CommandFailure, CommandReply, DispatcherState,
};
pub use envelope::{CommandEnvelope, CommandInfo, CommandResponse, DeviceCommand, parse_catalog};
pub use history::{CommandLog, CommandOutcome, CommandRecord, DEFAULT_LOG_CAPACITY};

#[cfg(test)]
pub(crate) use dispatcher::fake;
