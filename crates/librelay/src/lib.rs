pub mod error;
pub mod lifecycle;
pub mod log;
pub mod registry;
pub mod router;

pub use error::RelayError;
pub use lifecycle::{Lifecycle, SessionContext, TransitionError};
pub use log::{EntryStream, EventLog, LogSealed, ReplayWindowExceeded};
pub use registry::{RegistryConfig, SessionRegistry};
pub use router::{EventRouter, HandlerId};
