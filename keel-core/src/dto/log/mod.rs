//! Log DTOs for inter-service communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Query parameters of the log streaming call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    /// Only entries strictly after this instant are returned
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,

    /// Keep the stream open and forward new entries as they arrive
    #[serde(default)]
    pub follow: bool,
}
