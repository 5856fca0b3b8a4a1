pub mod body;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod headers;
pub mod sink;
pub mod target;
pub mod topics;
pub mod transport;
pub mod types;
pub mod validator;

#[cfg(test)]
mod testing;

pub use checksum::{Checksum, ChecksumTracker};
pub use config::{NetworkConfig, OtaConfig, RuntimeConfig};
pub use engine::{EngineAction, UpdateEngine};
pub use error::{BeginError, ErrorClass, InputError, ProtocolError, UpdateError};
pub use sink::UpdateSink;
pub use target::{TriggerRequest, UpdateTarget};
pub use topics::*;
pub use transport::{Transport, TransportEvent};
pub use types::{UpdatePhase, UpdateStatus};
