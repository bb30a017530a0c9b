use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[(&str, &str)] = &[
    (
        "documents",
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            persona_id TEXT NOT NULL,
            title TEXT,
            source_url TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "chunks",
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            page_start INTEGER,
            page_end INTEGER,
            section TEXT,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "chunk_vectors",
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "entities",
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            persona_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            authority REAL NOT NULL DEFAULT 0.5,
            mention_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "entity_aliases",
        r#"
        CREATE TABLE IF NOT EXISTS entity_aliases (
            entity_id TEXT NOT NULL,
            alias TEXT NOT NULL,
            alias_lower TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            is_primary INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_id, alias_lower),
            FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "knowledge_edges",
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_edges (
            id TEXT PRIMARY KEY,
            src_kind TEXT NOT NULL,
            src_id TEXT NOT NULL,
            dst_kind TEXT NOT NULL,
            dst_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            weight REAL NOT NULL,
            evidence_text TEXT,
            evidence_document_id TEXT
        )
        "#,
    ),
    (
        "conversations",
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            persona_id TEXT,
            turn INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "conversation_sources",
        r#"
        CREATE TABLE IF NOT EXISTS conversation_sources (
            conversation_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            last_used_turn INTEGER NOT NULL,
            last_used_at TEXT NOT NULL,
            carry_score REAL NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0,
            turns_inactive INTEGER NOT NULL DEFAULT 0,
            chunk_ids TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (conversation_id, document_id),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        )
        "#,
    ),
    (
        "query_analytics",
        r#"
        CREATE TABLE IF NOT EXISTS query_analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL,
            persona_id TEXT NOT NULL,
            conversation_id TEXT,
            query_hash TEXT NOT NULL,
            outcome TEXT NOT NULL,
            query_type TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            retrieval_time_ms INTEGER NOT NULL,
            average_similarity REAL NOT NULL,
            reranking_used INTEGER NOT NULL,
            cache_hit INTEGER NOT NULL,
            stats_json TEXT NOT NULL
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_persona ON documents(persona_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_entities_persona ON entities(persona_id)",
    "CREATE INDEX IF NOT EXISTS idx_aliases_lower ON entity_aliases(alias_lower)",
    "CREATE INDEX IF NOT EXISTS idx_edges_src ON knowledge_edges(src_kind, src_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_dst ON knowledge_edges(dst_kind, dst_id)",
    "CREATE INDEX IF NOT EXISTS idx_analytics_persona ON query_analytics(persona_id, recorded_at)",
];

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for (name, ddl) in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create table {}", name))?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
