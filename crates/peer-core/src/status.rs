use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Connection health of a peer as last observed by its maintainer.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No live connection and no attempt in progress
    #[default]
    Unavailable,
    /// Dial in progress
    Connecting,
    /// At least one live connection
    Available,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Unavailable => "unavailable",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Available => "available",
        }
    }

    pub fn is_available(&self) -> bool {
        *self == ConnectionStatus::Available
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
