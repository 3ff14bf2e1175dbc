mod helpers;

use cairn::index::sha256_hex;
use cairn::retrieval::{SearchStatus, NO_VERIFIED_MESSAGE};
use cairn::types::ConfidenceTier;

const TWO_SECTIONS: &str = "# Pets\nOur dog Biscuit sleeps in the laundry room.\n\n# Car\nThe minivan registration renews in March.\n";

#[tokio::test]
async fn indexed_chunks_match_their_file_bytes() {
    let t = helpers::test_daemon(None).await;
    t.write("notes/house.md", TWO_SECTIONS);
    t.daemon.reindex(false).await.unwrap();

    let conn = t.daemon.db().lock().unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT source_file, byte_start, byte_end, text, content_hash FROM chunks \
             WHERE invalidated_at IS NULL",
        )
        .unwrap();
    let rows: Vec<(String, i64, i64, String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert!(!rows.is_empty());
    for (file, start, end, text, hash) in rows {
        let bytes = std::fs::read(t.root().join(&file)).unwrap();
        let slice = &bytes[start as usize..end as usize];
        assert_eq!(slice, text.as_bytes(), "text must be the exact file slice of {file}");
        assert_eq!(sha256_hex(slice), hash, "hash round-trip failed for {file}");
    }
}

#[tokio::test]
async fn phrase_from_first_chunk_returns_only_that_chunk_verified() {
    let t = helpers::test_daemon(None).await;
    t.write("notes/house.md", TWO_SECTIONS);
    t.daemon.reindex(false).await.unwrap();

    let live = t
        .daemon
        .indexer()
        .live_chunk_ids("notes/house.md".into())
        .await
        .unwrap();
    assert_eq!(live.len(), 2, "each heading starts its own chunk");

    let response = t
        .daemon
        .retriever()
        .search("Biscuit sleeps laundry", None)
        .await
        .unwrap();

    assert_eq!(response.status, SearchStatus::Verified);
    let from_file: Vec<_> = response
        .results
        .iter()
        .filter(|r| r.source_file == "notes/house.md")
        .collect();
    assert_eq!(from_file.len(), 1);

    let hit = from_file[0];
    assert!(hit.text.contains("Biscuit"));
    assert!(!hit.text.contains("minivan"));
    let tag = hit
        .citation_tag
        .strip_prefix("[VERIFIED:")
        .and_then(|s| s.strip_suffix(']'))
        .unwrap();
    assert_eq!(tag.len(), 8);
    assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(tag, &sha256_hex(hit.text.as_bytes())[..8]);
    assert_eq!(hit.confidence_tier, ConfidenceTier::Medium);
}

#[tokio::test]
async fn edit_before_reindex_is_excluded_not_stale() {
    let t = helpers::test_daemon(None).await;
    let path = t.write("notes/wifi.md", "The guest wifi password is pelican42.\n");
    t.daemon.reindex(false).await.unwrap();

    let before = t.daemon.retriever().search("wifi password", None).await.unwrap();
    assert_eq!(before.results.len(), 1);

    std::fs::write(&path, "The guest wifi password is heron77.\n").unwrap();

    let after = t.daemon.retriever().search("wifi password", None).await.unwrap();
    assert!(after.results.is_empty(), "stale chunk must not verify");
    assert_eq!(after.status, SearchStatus::NoVerifiedMatch);
    assert_eq!(after.message.as_deref(), Some(NO_VERIFIED_MESSAGE));
    assert_eq!(after.unverified.len(), 1);
    assert_eq!(after.unverified[0].confidence_tier, ConfidenceTier::None);
    assert!(after.unverified[0].text.contains("pelican42"));
    assert!(
        t.count("SELECT COUNT(*) FROM chunk_log WHERE operation = 'hash_mismatch'") >= 1
    );

    t.daemon.indexer().index_file(path).await.unwrap();
    let reindexed = t.daemon.retriever().search("wifi password", None).await.unwrap();
    assert_eq!(reindexed.results.len(), 1);
    assert!(reindexed.results[0].text.contains("heron77"));
}

#[tokio::test]
async fn deleted_file_is_never_verified() {
    let t = helpers::test_daemon(None).await;
    let path = t.write("notes/plumber.md", "Call Rosalind the plumber for leaks.\n");
    t.daemon.reindex(false).await.unwrap();
    std::fs::remove_file(&path).unwrap();

    let before_reindex = t.daemon.retriever().search("Rosalind plumber", None).await.unwrap();
    assert!(before_reindex
        .results
        .iter()
        .all(|r| r.source_file != "notes/plumber.md"));
    assert_eq!(before_reindex.unverified[0].reason, "source file missing");

    let stats = t.daemon.reindex(false).await.unwrap();
    assert_eq!(stats.files_removed, 1);
    let after_reindex = t.daemon.retriever().search("Rosalind plumber", None).await.unwrap();
    assert!(after_reindex.results.is_empty());
    assert!(after_reindex.unverified.is_empty(), "invalidated chunks are not candidates");
}

#[tokio::test]
async fn never_stored_query_returns_explicit_empty_result() {
    let t = helpers::test_daemon(None).await;
    t.daemon.reindex(false).await.unwrap();

    let response = t
        .daemon
        .retriever()
        .search("zanzibar vaccination booster", None)
        .await
        .unwrap();
    assert!(response.is_empty());
    assert_eq!(response.status, SearchStatus::NoVerifiedMatch);
    assert_eq!(response.message.as_deref(), Some(NO_VERIFIED_MESSAGE));
    assert_eq!(t.backend.call_count(), 0, "search never calls the generation backend");
}

#[tokio::test]
async fn full_rebuild_keeps_results_verifiable() {
    let t = helpers::test_daemon(None).await;
    t.write("notes/house.md", TWO_SECTIONS);
    t.daemon.reindex(false).await.unwrap();

    let stats = t.daemon.reindex(true).await.unwrap();
    assert!(stats.chunks_added >= 2);

    let response = t.daemon.retriever().search("minivan registration", None).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].text.contains("minivan"));
}

#[tokio::test]
async fn chunks_and_queries_without_embeddable_words_never_match_semantically() {
    let t = helpers::test_daemon(None).await;
    assert_eq!(t.daemon.config().retrieval.min_similarity, 0.25);
    t.write(
        "notes/a.md",
        "# A\n\n# Dogs\nOur dog Biscuit sleeps in the laundry room.\n",
    );
    t.daemon.reindex(false).await.unwrap();
    assert_eq!(
        t.count(
            "SELECT COUNT(*) FROM chunks WHERE source_file = 'notes/a.md' \
             AND invalidated_at IS NULL AND has_embedding = 0"
        ),
        1,
        "the heading-only chunk is stored without a vector"
    );

    let unrelated = t
        .daemon
        .retriever()
        .search("zanzibar vaccination booster", None)
        .await
        .unwrap();
    assert_eq!(unrelated.status, SearchStatus::NoVerifiedMatch);
    assert!(unrelated.results.is_empty());

    let short_words = t.daemon.retriever().search("q z", None).await.unwrap();
    assert_eq!(short_words.status, SearchStatus::NoVerifiedMatch);
    assert!(short_words.results.is_empty());
    assert!(!short_words.degraded, "an empty query vector is not an embedder failure");

    let related = t.daemon.retriever().search("Biscuit laundry", None).await.unwrap();
    assert_eq!(related.results.len(), 1);
    assert!(related.results[0].text.contains("Biscuit"));
}
