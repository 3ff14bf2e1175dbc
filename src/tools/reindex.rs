//! MCP `reindex` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReindexParams {
    #[schemars(
        description = "Rebuild the whole index from scratch instead of an incremental pass (default: false)"
    )]
    pub full: Option<bool>,
}
