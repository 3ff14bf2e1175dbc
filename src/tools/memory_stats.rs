//! MCP `memory_stats` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_stats` MCP tool.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct MemoryStatsParams {
    /// Also run `PRAGMA integrity_check` and report extension versions.
    #[schemars(description = "Include a database health check (default: false)")]
    pub include_health: Option<bool>,
}
