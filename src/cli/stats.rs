use anyhow::Result;

use crate::config::CairnConfig;

/// Display index statistics in the terminal.
pub fn stats(config: &CairnConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;
    let overview = crate::index::overview(&conn)?;

    println!("Index Statistics");
    println!("{}", "=".repeat(40));
    println!("  Live chunks:         {}", overview.chunk_count);
    println!("  Invalidated chunks:  {}", overview.invalidated_count);
    println!("  Lexical-only chunks: {}", overview.lexical_only_count);
    println!("  Indexed files:       {}", overview.file_count);
    println!();

    println!("By Source:");
    for s in ["user_stated", "file", "web_search", "heartbeat_discovery"] {
        let count = overview.by_source.get(s).copied().unwrap_or(0);
        println!("  {:<20} {}", s, count);
    }
    println!();

    println!(
        "Last indexed:          {}",
        overview.last_indexed_at.as_deref().unwrap_or("never")
    );
    println!(
        "Embedding model:       {}",
        overview.embedding_model.as_deref().unwrap_or("(not set)")
    );

    Ok(())
}
