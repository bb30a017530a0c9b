//! SQLite-backed chunk index, knowledge graph and conversation store.
//!
//! Keyword search runs on the `chunks_fts` FTS5 table. Vector search is a
//! brute-force cosine scan over `chunk_vectors`. Allowlists are bound as a
//! JSON array and expanded with `json_each`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use context_relay_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use context_relay_core::models::{
    Alias, Chunk, ConversationSource, Entity, EntityKind, KnowledgeEdge, NodeRef, RelationType,
};
use context_relay_core::store::{
    count_keyword_hits, find_word_span, query_terms, ChunkIndex, ConversationSnapshot,
    ConversationStore, EntityMatch, KnowledgeGraph, ScoredChunk, SearchFilters,
};

const CHUNK_COLUMNS: &str =
    "c.id, c.document_id, c.chunk_index, c.content, c.token_count, c.page_start, c.page_end, c.section";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a conversation. Returns false if the id already exists.
    pub async fn create_conversation(&self, id: &str, persona_id: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, persona_id, turn, created_at, updated_at) VALUES (?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(persona_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persona a conversation was created for, if it exists.
    pub async fn conversation_persona(&self, id: &str) -> Result<Option<Option<String>>> {
        let row = sqlx::query("SELECT persona_id FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("persona_id")))
    }

    pub async fn insert_document(&self, id: &str, persona_id: &str, title: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, persona_id, title, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                persona_id = excluded.persona_id,
                title = excluded.title
            "#,
        )
        .bind(id)
        .bind(persona_id)
        .bind(title)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a chunk with its FTS row and, optionally, its vector.
    pub async fn insert_chunk(&self, chunk: &Chunk, vector: Option<(&str, &[f32])>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, content, token_count, page_start, page_end, section)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                token_count = excluded.token_count,
                page_start = excluded.page_start,
                page_end = excluded.page_end,
                section = excluded.section
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.token_count as i64)
        .bind(chunk.page_start.map(i64::from))
        .bind(chunk.page_end.map(i64::from))
        .bind(&chunk.section)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;

        if let Some((model, vec)) = vector {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, model, dims, embedding)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&chunk.id)
            .bind(model)
            .bind(vec.len() as i64)
            .bind(vec_to_blob(vec))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_entity(&self, persona_id: &str, entity: &Entity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (id, persona_id, name, kind, description, authority, mention_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                description = excluded.description,
                authority = excluded.authority,
                mention_count = excluded.mention_count
            "#,
        )
        .bind(&entity.id)
        .bind(persona_id)
        .bind(&entity.name)
        .bind(entity.kind.as_str())
        .bind(&entity.description)
        .bind(entity.authority)
        .bind(entity.mention_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_alias(&self, alias: &Alias) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_aliases (entity_id, alias, alias_lower, confidence, is_primary)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, alias_lower) DO UPDATE SET
                alias = excluded.alias,
                confidence = excluded.confidence,
                is_primary = excluded.is_primary
            "#,
        )
        .bind(&alias.entity_id)
        .bind(&alias.alias)
        .bind(alias.alias.to_lowercase())
        .bind(alias.confidence)
        .bind(alias.is_primary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_edge(&self, edge: &KnowledgeEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO knowledge_edges
                (id, src_kind, src_id, dst_kind, dst_id, relation, weight, evidence_text, evidence_document_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.id)
        .bind(edge.src.kind_str())
        .bind(edge.src.id())
        .bind(edge.dst.kind_str())
        .bind(edge.dst.id())
        .bind(edge.relation.as_str())
        .bind(edge.weight)
        .bind(&edge.evidence_text)
        .bind(&edge.evidence_document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Turn free text into an FTS5 query of quoted terms joined by OR.
///
/// Returns `None` when the text has no searchable terms.
pub fn fts_query(text: &str) -> Option<String> {
    let terms = query_terms(text);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn allowlist_json(filters: &SearchFilters) -> Result<Option<String>> {
    filters
        .document_ids
        .as_ref()
        .map(|ids| serde_json::to_string(ids).context("Failed to encode document allowlist"))
        .transpose()
}

fn ids_json(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids).context("Failed to encode id list")
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let token_count: i64 = row.get("token_count");
    let page_start: Option<i64> = row.get("page_start");
    let page_end: Option<i64> = row.get("page_end");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        content: row.get("content"),
        token_count: token_count.max(0) as u32,
        chunk_index: row.get("chunk_index"),
        page_start: page_start.and_then(|p| u32::try_from(p).ok()),
        page_end: page_end.and_then(|p| u32::try_from(p).ok()),
        section: row.get("section"),
    }
}

fn row_to_entity(row: &SqliteRow) -> Option<Entity> {
    let kind: String = row.get("kind");
    let Some(kind) = EntityKind::parse(&kind) else {
        warn!(entity = %row.get::<String, _>("id"), kind = %kind, "skipping entity with unknown kind");
        return None;
    };
    let mention_count: i64 = row.get("mention_count");
    Some(Entity {
        id: row.get("id"),
        name: row.get("name"),
        kind,
        description: row.get("description"),
        authority: row.get("authority"),
        mention_count: mention_count.max(0) as u32,
    })
}

fn row_to_edge(row: &SqliteRow) -> Option<KnowledgeEdge> {
    let id: String = row.get("id");
    let relation: String = row.get("relation");
    let src_kind: String = row.get("src_kind");
    let dst_kind: String = row.get("dst_kind");
    let src = NodeRef::from_parts(&src_kind, row.get("src_id"));
    let dst = NodeRef::from_parts(&dst_kind, row.get("dst_id"));
    match (src, dst, RelationType::parse(&relation)) {
        (Some(src), Some(dst), Some(relation)) => Some(KnowledgeEdge {
            id,
            src,
            dst,
            relation,
            weight: row.get("weight"),
            evidence_text: row.get("evidence_text"),
            evidence_document_id: row.get("evidence_document_id"),
        }),
        _ => {
            warn!(edge = %id, relation = %relation, "skipping malformed edge");
            None
        }
    }
}

fn row_to_source(row: &SqliteRow) -> Result<ConversationSource> {
    let last_used_at: String = row.get("last_used_at");
    let chunk_ids: String = row.get("chunk_ids");
    let last_used_turn: i64 = row.get("last_used_turn");
    let turns_inactive: i64 = row.get("turns_inactive");
    Ok(ConversationSource {
        document_id: row.get("document_id"),
        last_used_turn: last_used_turn.max(0) as u32,
        last_used_at: DateTime::parse_from_rfc3339(&last_used_at)
            .with_context(|| format!("Bad last_used_at timestamp: {}", last_used_at))?
            .with_timezone(&Utc),
        carry_score: row.get("carry_score"),
        pinned: row.get("pinned"),
        turns_inactive: turns_inactive.max(0) as u32,
        chunk_ids: serde_json::from_str(&chunk_ids).unwrap_or_default(),
    })
}

#[async_trait]
impl ChunkIndex for SqliteStore {
    async fn keyword_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let allow = allowlist_json(filters)?;
        let sql = format!(
            r#"
            SELECT {CHUNK_COLUMNS}, chunks_fts.rank AS fts_rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE chunks_fts MATCH ?
              AND d.persona_id = ?
              AND (? IS NULL OR c.document_id IN (SELECT value FROM json_each(?)))
            ORDER BY chunks_fts.rank, c.id
            LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&fts)
            .bind(&filters.persona_id)
            .bind(&allow)
            .bind(&allow)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("FTS keyword search failed")?;

        let terms = query_terms(query);
        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("fts_rank");
                let chunk = row_to_chunk(row);
                let keyword_hits = count_keyword_hits(&chunk.content, &terms);
                ScoredChunk {
                    chunk,
                    score: -rank,
                    keyword_hits,
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let allow = allowlist_json(filters)?;
        let sql = format!(
            r#"
            SELECT {CHUNK_COLUMNS}, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE d.persona_id = ?
              AND (? IS NULL OR c.document_id IN (SELECT value FROM json_each(?)))
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&filters.persona_id)
            .bind(&allow)
            .bind(&allow)
            .fetch_all(&self.pool)
            .await
            .context("vector scan failed")?;

        let mut candidates: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                ScoredChunk {
                    chunk: row_to_chunk(row),
                    score: cosine_similarity(query_vec, &vec) as f64,
                    keyword_hits: 0,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.id IN (SELECT value FROM json_each(?))"
        );
        let rows = sqlx::query(&sql)
            .bind(ids_json(ids)?)
            .fetch_all(&self.pool)
            .await?;
        let mut found: std::collections::HashMap<String, Chunk> = rows
            .iter()
            .map(row_to_chunk)
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn representative_chunks(
        &self,
        filters: &SearchFilters,
        document_ids: &[String],
        per_document: usize,
    ) -> Result<Vec<Chunk>> {
        if document_ids.is_empty() || per_document == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {CHUNK_COLUMNS}
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.persona_id = ?
              AND c.document_id IN (SELECT value FROM json_each(?))
            ORDER BY c.document_id, c.chunk_index
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&filters.persona_id)
            .bind(ids_json(document_ids)?)
            .fetch_all(&self.pool)
            .await?;
        let chunks: Vec<Chunk> = rows.iter().map(row_to_chunk).collect();

        let mut out = Vec::new();
        for doc_id in document_ids.iter().filter(|d| filters.allows(d)) {
            out.extend(
                chunks
                    .iter()
                    .filter(|c| &c.document_id == doc_id)
                    .take(per_document)
                    .cloned(),
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl KnowledgeGraph for SqliteStore {
    async fn match_entities(&self, persona_id: &str, query: &str) -> Result<Vec<EntityMatch>> {
        let lower = query.to_lowercase();
        // Substring prefilter in SQL, word boundaries checked below.
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.name, e.kind, e.description, e.authority, e.mention_count,
                   e.name AS matched, 1.0 AS confidence
            FROM entities e
            WHERE e.persona_id = ? AND instr(?, lower(e.name)) > 0
            UNION ALL
            SELECT e.id, e.name, e.kind, e.description, e.authority, e.mention_count,
                   a.alias AS matched, a.confidence AS confidence
            FROM entity_aliases a
            JOIN entities e ON e.id = a.entity_id
            WHERE e.persona_id = ? AND instr(?, a.alias_lower) > 0
            "#,
        )
        .bind(persona_id)
        .bind(&lower)
        .bind(persona_id)
        .bind(&lower)
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<EntityMatch> = rows
            .iter()
            .filter_map(|row| {
                let matched: String = row.get("matched");
                let span = find_word_span(&lower, &matched.to_lowercase())?;
                Some(EntityMatch {
                    entity: row_to_entity(row)?,
                    matched,
                    alias_confidence: row.get("confidence"),
                    span,
                })
            })
            .collect();
        matches.sort_by(|a, b| a.span.cmp(&b.span).then_with(|| a.entity.id.cmp(&b.entity.id)));
        Ok(matches)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, name, kind, description, authority, mention_count FROM entities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().and_then(row_to_entity))
    }

    async fn edges_for(&self, node: &NodeRef) -> Result<Vec<KnowledgeEdge>> {
        let rows = sqlx::query(
            r#"
            SELECT id, src_kind, src_id, dst_kind, dst_id, relation, weight,
                   evidence_text, evidence_document_id
            FROM knowledge_edges
            WHERE (src_kind = ? AND src_id = ?) OR (dst_kind = ? AND dst_id = ?)
            ORDER BY id
            "#,
        )
        .bind(node.kind_str())
        .bind(node.id())
        .bind(node.kind_str())
        .bind(node.id())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(row_to_edge).collect())
    }

    async fn aliases_for(&self, entity_id: &str) -> Result<Vec<Alias>> {
        let rows = sqlx::query(
            "SELECT entity_id, alias, confidence, is_primary FROM entity_aliases WHERE entity_id = ? ORDER BY alias_lower",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Alias {
                entity_id: row.get("entity_id"),
                alias: row.get("alias"),
                confidence: row.get("confidence"),
                is_primary: row.get("is_primary"),
            })
            .collect())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_sources(&self, conversation_id: &str) -> Result<ConversationSnapshot> {
        let turn: Option<i64> = sqlx::query_scalar("SELECT turn FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(turn) = turn else {
            return Ok(ConversationSnapshot::default());
        };
        let rows = sqlx::query(
            r#"
            SELECT document_id, last_used_turn, last_used_at, carry_score, pinned,
                   turns_inactive, chunk_ids
            FROM conversation_sources
            WHERE conversation_id = ?
            ORDER BY document_id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ConversationSnapshot {
            turn: turn.max(0) as u32,
            sources: rows.iter().map(row_to_source).collect::<Result<_>>()?,
        })
    }

    async fn upsert_sources(
        &self,
        conversation_id: &str,
        turn: u32,
        sources: &[ConversationSource],
        evicted: &[String],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, turn, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                turn = excluded.turn,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(turn as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for doc_id in evicted {
            sqlx::query(
                "DELETE FROM conversation_sources WHERE conversation_id = ? AND document_id = ?",
            )
            .bind(conversation_id)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        }

        for source in sources {
            sqlx::query(
                r#"
                INSERT INTO conversation_sources
                    (conversation_id, document_id, last_used_turn, last_used_at, carry_score,
                     pinned, turns_inactive, chunk_ids)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(conversation_id, document_id) DO UPDATE SET
                    last_used_turn = excluded.last_used_turn,
                    last_used_at = excluded.last_used_at,
                    carry_score = excluded.carry_score,
                    pinned = excluded.pinned,
                    turns_inactive = excluded.turns_inactive,
                    chunk_ids = excluded.chunk_ids
                "#,
            )
            .bind(conversation_id)
            .bind(&source.document_id)
            .bind(source.last_used_turn as i64)
            .bind(source.last_used_at.to_rfc3339())
            .bind(source.carry_score)
            .bind(source.pinned)
            .bind(source.turns_inactive as i64)
            .bind(serde_json::to_string(&source.chunk_ids)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_pinned(
        &self,
        conversation_id: &str,
        document_id: &str,
        pinned: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO conversations (id, turn, created_at, updated_at) VALUES (?, 0, ?, ?)",
        )
        .bind(conversation_id)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE conversation_sources SET pinned = ? WHERE conversation_id = ? AND document_id = ?",
        )
        .bind(pinned)
        .bind(conversation_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO conversation_sources
                    (conversation_id, document_id, last_used_turn, last_used_at, carry_score,
                     pinned, turns_inactive, chunk_ids)
                SELECT id, ?, turn, ?, 1.0, ?, 0, '[]' FROM conversations WHERE id = ?
                "#,
            )
            .bind(document_id)
            .bind(now.to_rfc3339())
            .bind(pinned)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
