pub mod backend;
pub mod fixtures;
pub mod logging;
pub mod model;
pub mod session;

pub use backend::{BackendProbe, CallCounts, RecordingBackend};
pub use logging::WarningCounter;
pub use session::{TestSession, sorted};
