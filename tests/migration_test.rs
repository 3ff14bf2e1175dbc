mod helpers;

use cairn::db;
use cairn::db::meta::{get_embedding_model, set_embedding_model};

fn insert_embedded_chunk(conn: &rusqlite::Connection) {
    conn.execute(
        "INSERT INTO chunks (id, source_file, byte_start, byte_end, text, content_hash, \
         has_embedding, created_at) VALUES ('c1', 'a.md', 0, 1, 'x', 'h', 1, 'now')",
        [],
    )
    .unwrap();
}

#[test]
fn empty_index_adopts_the_active_model() {
    let conn = helpers::test_db();
    set_embedding_model(&conn, "all-MiniLM-L6-v2").unwrap();
    assert!(cairn::index::check_embedding_model(&conn, "hashed-384").unwrap());
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("hashed-384"));
}

#[test]
fn populated_index_flags_a_model_change() {
    let conn = helpers::test_db();
    set_embedding_model(&conn, "hashed-384").unwrap();
    insert_embedded_chunk(&conn);

    assert!(cairn::index::check_embedding_model(&conn, "hashed-384").unwrap());
    assert!(!cairn::index::check_embedding_model(&conn, "all-MiniLM-L6-v2").unwrap());
    assert_eq!(
        get_embedding_model(&conn).unwrap().as_deref(),
        Some("hashed-384"),
        "a populated index keeps its recorded model until rebuilt"
    );
}

#[test]
fn populated_index_without_a_recorded_model_is_flagged() {
    let conn = helpers::test_db();
    insert_embedded_chunk(&conn);
    assert!(!cairn::index::check_embedding_model(&conn, "hashed-384").unwrap());
    assert!(get_embedding_model(&conn).unwrap().is_none());
}

#[test]
fn health_check_reports_the_recorded_model() {
    let conn = helpers::test_db();
    set_embedding_model(&conn, "hashed-384").unwrap();
    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::meta::CURRENT_SCHEMA_VERSION);
    assert_eq!(report.embedding_model.as_deref(), Some("hashed-384"));
    assert!(!report.sqlite_vec_version.is_empty());
    assert_eq!(report.chunk_count, 0);
}
