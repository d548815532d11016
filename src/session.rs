//! Session: the composition of pool, scheduler, storage and transports
//! into one downloadable torrent, plus the event bus embedders consume.

mod bus;
mod discovery;
mod engine;
mod error;

pub use bus::{Event, EventBus};
pub use discovery::{parse_compact_v4, parse_compact_v6, SharedResources};
pub use engine::{Session, SessionState};
pub use error::SessionError;

#[cfg(test)]
mod tests;
