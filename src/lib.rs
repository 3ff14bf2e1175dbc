//! Verified memory for a personal assistant: answers come only from facts the daemon can
//! prove it stored.
//!
//! Cairn indexes a workspace of markdown files into SQLite (FTS5 for keyword search,
//! [sqlite-vec](https://github.com/asg017/sqlite-vec) for vectors). Every chunk carries the
//! SHA-256 of its exact bytes; at query time each candidate is re-read from disk and
//! re-hashed, and only matches are returned, tagged `[VERIFIED:xxxxxxxx]`. A timer-driven
//! heartbeat works through a checklist in `HEARTBEAT.md`, serialized against interactive
//! writes by a single workspace lock.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 and sqlite-vec; the files are the source of truth and
//!   the index is a rebuildable cache
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions), or a
//!   feature-hashing provider that needs no download
//! - **Search**: lexical rank and cosine similarity fused with configurable weights,
//!   then hash re-verification and confidence tiers
//! - **Transport**: MCP over stdio or streamable HTTP, plus a JSON/SSE API
//!
//! # Modules
//!
//! - [`workspace`]: the on-disk tree, atomic writes, and the workspace lock
//! - [`index`]: chunking, front-matter, hashing, and the index write path
//! - [`retrieval`]: verified hybrid search and confidence tiers
//! - [`facts`]: the provenance-checked fact write path
//! - [`heartbeat`]: the task file and the cycle state machine
//! - [`session`]: conversation history, prompt assembly, and compaction
//! - [`chat`]: streamed chat turns with the `store_fact` tool
//! - [`daemon`]: the process-wide context that wires everything together

pub mod chat;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod db;
pub mod embedding;
pub mod error;
pub mod facts;
pub mod generation;
pub mod heartbeat;
pub mod index;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod tools;
pub mod types;
pub mod workspace;
