pub mod authority;
pub mod handoff;
pub mod hazard;
pub mod mission;
pub mod telemetry;

pub use authority::AuthorityState;
pub use handoff::{handoff, HandoffReader, HandoffWriter};
pub use hazard::{HazardSignal, Severity};
pub use mission::{Mission, UploadStatus, Waypoint, WaypointAction};
pub use telemetry::{FcTelemetry, LinkHealth};
