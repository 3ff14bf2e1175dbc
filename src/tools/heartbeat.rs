//! MCP heartbeat tool parameter definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct HeartbeatRunParams {}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct HeartbeatStatusParams {
    #[schemars(description = "Include the per-task view of the task file (default: true)")]
    pub include_tasks: Option<bool>,
}
