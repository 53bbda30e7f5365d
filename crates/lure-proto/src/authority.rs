use serde::{Deserialize, Serialize};
use std::fmt;

/// Which source currently owns the aircraft's control inputs.
///
/// Written only by the control task; everyone else reads it through a
/// [`crate::HandoffReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorityState {
    /// FC autopilot flies the uploaded mission; channel output is pass-through.
    Mission,
    /// Vision pipeline commands an avoidance maneuver.
    Override,
    /// Conservative hold/land. Left only through an explicit re-arm.
    Failsafe,
}

impl AuthorityState {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthorityState::Mission => "MISSION",
            AuthorityState::Override => "OVERRIDE",
            AuthorityState::Failsafe => "FAILSAFE",
        }
    }
}

impl fmt::Display for AuthorityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
