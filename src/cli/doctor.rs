//! CLI `doctor` command: database, workspace, and model diagnostics.

use anyhow::{Context, Result};

use crate::config::CairnConfig;
use crate::db;
use crate::workspace::{MEMORY_FILE, SOUL_FILE, TASK_FILE};

/// Run diagnostics and print a health report.
pub fn doctor(config: &CairnConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let root = config.resolved_workspace_root();

    println!("Cairn Health Report");
    println!("===================");
    println!();
    println!("Workspace:         {}", root.display());
    for name in [MEMORY_FILE, SOUL_FILE, TASK_FILE] {
        let state = if root.join(name).exists() { "ok" } else { "missing" };
        println!("  {:<16} {state}", name);
    }
    println!();

    if !db_path.exists() {
        println!("Index database: not found at {}", db_path.display());
        println!("Run `cairn init` to create the workspace and index.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Embedding model:");
    println!(
        "  Stored:          {}",
        report.embedding_model.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Configured:      {} ({})",
        config.embedding.model, config.embedding.provider
    );
    if config.embedding.provider == "local" {
        let cache = crate::config::expand_tilde(&config.embedding.cache_dir);
        if !cache.join("model.onnx").exists() {
            println!("  WARNING: model files missing. Run `cairn model download`.");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Live chunks:     {}", report.chunk_count);
    println!("  Indexed files:   {}", report.file_count);
    println!("  Chunk log:       {}", report.log_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("The index is a cache of the workspace files. To recover:");
        println!("  rm {} && cairn reindex --full", db_path.display());
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
