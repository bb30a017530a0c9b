//! Core data models shared by every retrieval stage.
//!
//! Chunks, entities, aliases and edges are read-only inputs produced by
//! the ingestion side. Candidates live for one query. Conversation
//! sources and citations are the only records this crate creates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable unit of retrievable text.
///
/// Embedding vectors and lexical payloads live inside the index and are
/// never carried on the query path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub token_count: u32,
    /// Position of the chunk within its document.
    pub chunk_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// Closed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Organization,
    Product,
    Technology,
    Concept,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Organization => "organization",
            EntityKind::Product => "product",
            EntityKind::Technology => "technology",
            EntityKind::Concept => "concept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Some(EntityKind::Person),
            "organization" | "org" => Some(EntityKind::Organization),
            "product" => Some(EntityKind::Product),
            "technology" => Some(EntityKind::Technology),
            "concept" => Some(EntityKind::Concept),
            _ => None,
        }
    }
}

/// A named real-world thing in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub description: String,
    /// Trustworthiness / centrality in `[0, 1]`.
    pub authority: f64,
    pub mention_count: u32,
}

/// Alternate surface form for an [`Entity`].
///
/// Alias strings are not globally unique; the recognizer resolves
/// collisions by confidence and authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alias {
    pub entity_id: String,
    pub alias: String,
    pub confidence: f64,
    pub is_primary: bool,
}

/// Either end of a [`KnowledgeEdge`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Entity(String),
    Document(String),
}

impl NodeRef {
    pub fn id(&self) -> &str {
        match self {
            NodeRef::Entity(id) | NodeRef::Document(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            NodeRef::Entity(_) => "entity",
            NodeRef::Document(_) => "document",
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "entity" => Some(NodeRef::Entity(id)),
            "document" => Some(NodeRef::Document(id)),
            _ => None,
        }
    }
}

/// Closed set of edge relation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    AuthoredBy,
    Cites,
    UsesComponent,
    Develops,
    Mentions,
    PartOf,
    Implements,
    AffiliatedWith,
    RelatedTo,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::AuthoredBy => "authored_by",
            RelationType::Cites => "cites",
            RelationType::UsesComponent => "uses_component",
            RelationType::Develops => "develops",
            RelationType::Mentions => "mentions",
            RelationType::PartOf => "part_of",
            RelationType::Implements => "implements",
            RelationType::AffiliatedWith => "affiliated_with",
            RelationType::RelatedTo => "related_to",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authored_by" => Some(RelationType::AuthoredBy),
            "cites" => Some(RelationType::Cites),
            "uses_component" => Some(RelationType::UsesComponent),
            "develops" => Some(RelationType::Develops),
            "mentions" => Some(RelationType::Mentions),
            "part_of" => Some(RelationType::PartOf),
            "implements" => Some(RelationType::Implements),
            "affiliated_with" => Some(RelationType::AffiliatedWith),
            "related_to" => Some(RelationType::RelatedTo),
            _ => None,
        }
    }
}

/// A directed, typed, weighted relation between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEdge {
    pub id: String,
    pub src: NodeRef,
    pub dst: NodeRef,
    pub relation: RelationType,
    /// Confidence in `[0, 1]`.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_document_id: Option<String>,
}

impl KnowledgeEdge {
    /// The node on the other side of `from`, if `from` is an endpoint.
    pub fn other_end(&self, from: &NodeRef) -> Option<&NodeRef> {
        if &self.src == from {
            Some(&self.dst)
        } else if &self.dst == from {
            Some(&self.src)
        } else {
            None
        }
    }
}

/// Which retrieval signal produced a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Signal {
    Lexical { score: f64, keyword_hits: u32 },
    Vector { similarity: f64 },
    Graph { boost: f64, entity_id: String },
}

/// One signal's opinion about one chunk.
///
/// Candidates from every stage are pooled by chunk id before fusion;
/// the `signal` discriminant keeps that merge exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCandidate {
    pub chunk: Chunk,
    pub signal: Signal,
}

/// Per (conversation, document) carry-over state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSource {
    pub document_id: String,
    pub last_used_turn: u32,
    pub last_used_at: DateTime<Utc>,
    pub carry_score: f64,
    pub pinned: bool,
    pub turns_inactive: u32,
    /// Chunks that answered the turn this source was last used in.
    #[serde(default)]
    pub chunk_ids: Vec<String>,
}

impl ConversationSource {
    pub fn fresh(document_id: &str, turn: u32, chunk_ids: Vec<String>) -> Self {
        Self {
            document_id: document_id.to_string(),
            last_used_turn: turn,
            last_used_at: Utc::now(),
            carry_score: 1.0,
            pinned: false,
            turns_inactive: 0,
            chunk_ids,
        }
    }
}

/// A stable reference from generated text back to a source chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// `[1]`, `[2]`, … in first-appearance order.
    pub marker: String,
    pub document_id: String,
    pub chunk_id: String,
    #[serde(default)]
    pub supporting_chunk_ids: Vec<String>,
    pub fact_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}
