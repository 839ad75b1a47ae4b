//! Domain models - core timing types and error taxonomy
//!
//! - `types` - gate events, timing session, sprint records, distances,
//!   connection state
//! - `errors` - typed errors for connection, timing and notification paths

pub mod errors;
pub mod types;

pub use errors::{ConnectionError, EngineError, NotifierError, TimingError, TransportError};
pub use types::{
    ChannelId, ConnectionState, Distance, DistancePreset, EventKind, GateEvent, Lane,
    PeripheralConnection, SprintRecord, TimingSession, TimingState,
};
