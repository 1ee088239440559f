//! Session core for estimate: rendezvous, transport links, and the
//! host/participant session controllers.
//!
//! One device acts as host, others as participants. The host owns the
//! room code, the roster, and the round counter; participants derive a
//! local view from the messages the host fans out. All mutable session
//! state lives inside a single actor task per role; the rest of the
//! application observes it through `watch` snapshots.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod participant;
pub mod rendezvous;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use host::{HostSession, RoomState};
pub use participant::{ConnectionStatus, ParticipantSession, ParticipantView};
pub use rendezvous::{Advertisement, Rendezvous, Sighting};
pub use transport::{Answer, Link, LinkEvent, LinkState, Offer};
