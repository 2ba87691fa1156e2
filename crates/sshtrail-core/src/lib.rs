//! sshtrail core - event model, serialization, and terminal aggregation
//!
//! This crate owns everything between the raw kernel records and the JSON
//! lines handed to consumers:
//!
//! - **Events**: owned user-space snapshots of the wire structs
//! - **Serialize**: the emitted JSON schema, one minified object per event
//! - **Clock**: boot-time to wall-clock translation with suspend compensation
//! - **Aggregator**: collapses bursty terminal reads into windowed events

pub mod aggregator;
pub mod clock;
pub mod events;
pub mod serialize;

pub use aggregator::TerminalAggregator;
pub use clock::WallClockTranslator;
pub use events::{
    CommandPhase, CommandSnapshot, ConnectionPhase, ConnectionSnapshot, SessionEvent,
    TcpEndpoints,
};
pub use serialize::EventSerializer;
