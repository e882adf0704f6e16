//! rcm-services — connection and service registries, the per-connection
//! state object, and the seams the engine talks to the outside world
//! through.

pub mod callback;
pub mod conn_table;
pub mod connection;
pub mod service_table;
pub mod transport;

pub use callback::{
    AcceptParams, AltPathStatus, CallbackOutcome, CmEvent, CmEventKind, CmHandler,
    DisconnectReason, IdleReason, ReplySlot, RepEvent, ReqEvent,
};
pub use conn_table::{ConnTable, DuplicateRemote, Interrupted};
pub use connection::{CmState, Connection, Role, TimerPurpose, INVALID_COMM_ID};
pub use service_table::{Service, ServiceError, ServiceGuard, ServiceTable};
pub use transport::{MadTransport, QpAttr, QpControl, QpError, QpState, TransportError};
