//! Page runtime: the coordinator that wires form sessions, the offline
//! worker and the event bus together, plus the HTTP submit transport.

pub mod coordinator;
pub mod reporter;
pub mod transport;

pub use coordinator::{swipe_direction, Coordinator, FormDecl, InitError, SWIPE_THRESHOLD};
pub use reporter::{ErrorOrigin, ErrorReporter, ReportedError};
pub use transport::HttpSubmitTransport;
