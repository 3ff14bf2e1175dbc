pub mod doctor;
pub mod heartbeat;
pub mod reindex;
pub mod search;
pub mod stats;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::CairnConfig;
use crate::workspace::lock::Actor;
use crate::workspace::Workspace;

/// Create the workspace layout, template files, and the index database.
pub async fn init(config: &CairnConfig) -> Result<()> {
    let workspace = Workspace::from_config(config);
    let guard = workspace.acquire(Actor::Indexer, "init").await?;
    let created = workspace.init(&guard)?;
    drop(guard);

    let db_path = config.resolved_db_path();
    crate::db::open_database(&db_path)?;

    if created {
        println!("Created workspace at {}", workspace.root().display());
    } else {
        println!(
            "Workspace already exists at {}; missing files restored",
            workspace.root().display()
        );
    }
    println!("Index database at {}", db_path.display());
    Ok(())
}

const MODEL_BASE_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

/// `(file name in the cache dir, path under the model repo)`.
const MODEL_FILES: [(&str, &str); 2] = [
    ("model.onnx", "onnx/model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
];

/// Fetch the ONNX model and tokenizer into the cache directory, skipping files already there.
pub async fn model_download(config: &crate::config::EmbeddingConfig) -> Result<()> {
    let cache_dir = crate::config::expand_tilde(&config.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    for (name, remote) in MODEL_FILES {
        let dest = cache_dir.join(name);
        if dest.exists() {
            println!("{name}: already present at {}", dest.display());
            continue;
        }
        println!("{name}: downloading...");
        download_file(&format!("{MODEL_BASE_URL}/{remote}"), &dest).await?;
        println!("{name}: saved to {}", dest.display());
    }

    println!("Embedding model ready. Set embedding.provider = \"local\" to use it.");
    Ok(())
}

/// Download a file from a URL with progress bar. Uses atomic write (tmp + rename).
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .context("invalid progress template")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path: PathBuf = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}
