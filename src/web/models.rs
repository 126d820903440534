// JSON bodies returned by the API.

use serde::{Deserialize, Serialize};

/// Body of every non-200 response from `/api/process-image`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
