use anyhow::Result;

use crate::config::CairnConfig;
use crate::daemon::Daemon;

/// Reindex the workspace. `Daemon::open` already runs an incremental pass, so only a
/// full rebuild does extra work here.
pub async fn reindex(config: CairnConfig, full: bool) -> Result<()> {
    let daemon = Daemon::open(config).await?;
    if full {
        println!("Rebuilding index from scratch...");
    }
    let stats = daemon.reindex(full).await?;

    println!("Files scanned:       {}", stats.files_scanned);
    println!("Files indexed:       {}", stats.files_indexed);
    println!("Files removed:       {}", stats.files_removed);
    println!("Chunks added:        {}", stats.chunks_added);
    println!("Chunks invalidated:  {}", stats.chunks_invalidated);
    if stats.lexical_only > 0 {
        println!(
            "Lexical-only chunks: {} (no embedding; see log)",
            stats.lexical_only
        );
    }
    if stats.files_skipped > 0 {
        println!(
            "Files skipped:       {} (not valid UTF-8 or unreadable; see log)",
            stats.files_skipped
        );
    }

    daemon.shutdown().await;
    Ok(())
}
