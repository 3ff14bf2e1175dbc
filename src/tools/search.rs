//! MCP `search` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `search` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    #[schemars(description = "Natural language query")]
    pub query: String,

    /// Falls back to `retrieval.default_top_k`.
    #[schemars(description = "Maximum number of verified results to return (default: 5)")]
    pub top_k: Option<usize>,
}
