use anyhow::Result;

use crate::config::CairnConfig;
use crate::daemon::Daemon;

/// Run a verified search from the terminal.
pub async fn search(config: CairnConfig, query: &str, top_k: Option<usize>) -> Result<()> {
    let daemon = Daemon::open(config).await?;
    let response = daemon.retriever().search(query, top_k).await?;

    if response.degraded {
        println!("(semantic search unavailable, lexical matches only)\n");
    }

    if response.results.is_empty() {
        println!(
            "{}.",
            response
                .message
                .as_deref()
                .unwrap_or(crate::retrieval::NO_VERIFIED_MESSAGE)
        );
    } else {
        println!("Found {} verified result(s)\n", response.results.len());
    }

    for (i, result) in response.results.iter().enumerate() {
        println!(
            "  {}. {} {} (confidence: {}, score: {:.4})",
            i + 1,
            result.citation_tag,
            result.source_file,
            result.confidence_tier,
            result.score
        );
        println!("     {}", preview(&result.text, 160));
        println!();
    }

    if !response.unverified.is_empty() {
        println!("Unverified (changed on disk since indexing; run `cairn reindex`):");
        for u in &response.unverified {
            println!("  - {} ({}): {}", u.source_file, u.reason, preview(&u.text, 80));
        }
    }

    daemon.shutdown().await;
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max_chars {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        flat
    }
}
