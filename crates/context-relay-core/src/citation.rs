//! Citation assembly.
//!
//! Context chunks are grouped by document in first-appearance order.
//! Each document keeps its best chunk plus up to `max_supporting` more
//! and gets a single marker.

use std::collections::HashMap;

use crate::bundle::ContextChunk;
use crate::models::Citation;

/// Longest fact summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 200;

/// First sentence of `text`, at most [`MAX_SUMMARY_CHARS`] characters.
pub fn fact_summary(text: &str) -> String {
    let text = text.trim();
    let mut end = text.len();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                end = i + c.len_utf8();
                break;
            }
        } else if c == '\n' && chars.peek().is_some_and(|(_, next)| *next == '\n') {
            end = i;
            break;
        }
    }
    let sentence = text[..end].trim();
    let summary: String = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
    match summary.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => summary[..idx].trim_end().to_string(),
        None => summary,
    }
}

/// Deduplicate `merged` by document and attach citations.
///
/// Returned chunks are grouped per document (best chunk, then supporting
/// chunks by score) and the groups keep first-appearance order, so
/// marker `[n]` covers the `n`th group.
pub fn assemble(merged: Vec<ContextChunk>, max_supporting: usize) -> (Vec<ContextChunk>, Vec<Citation>) {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(usize, ContextChunk)>> = HashMap::new();
    for (pos, c) in merged.into_iter().enumerate() {
        let doc = c.chunk.document_id.clone();
        let group = groups.entry(doc.clone()).or_default();
        if group.is_empty() {
            order.push(doc);
        }
        if !group.iter().any(|(_, g)| g.chunk.id == c.chunk.id) {
            group.push((pos, c));
        }
    }

    let mut chunks = Vec::new();
    let mut citations = Vec::with_capacity(order.len());
    for (n, doc) in order.iter().enumerate() {
        let Some(mut group) = groups.remove(doc) else {
            continue;
        };
        group.sort_by(|(pa, a), (pb, b)| b.score.total_cmp(&a.score).then_with(|| pa.cmp(pb)));
        group.truncate(1 + max_supporting);

        let best = &group[0].1;
        let page_start = group.iter().filter_map(|(_, c)| c.chunk.page_start).min();
        let page_end = group
            .iter()
            .filter_map(|(_, c)| c.chunk.page_end.or(c.chunk.page_start))
            .max();
        citations.push(Citation {
            marker: format!("[{}]", n + 1),
            document_id: doc.clone(),
            chunk_id: best.chunk.id.clone(),
            supporting_chunk_ids: group[1..].iter().map(|(_, c)| c.chunk.id.clone()).collect(),
            fact_summary: fact_summary(&best.chunk.content),
            page_start,
            page_end,
            section: best.chunk.section.clone(),
        });
        chunks.extend(group.into_iter().map(|(_, c)| c));
    }
    (chunks, citations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::tests::chunk;

    fn ctx(id: &str, doc: &str, text: &str, score: f64) -> ContextChunk {
        ContextChunk::retrieved(chunk(id, doc, text), score)
    }

    #[test]
    fn markers_follow_first_appearance() {
        let merged = vec![
            ctx("a1", "A", "Alpha one.", 0.9),
            ctx("b1", "B", "Beta one.", 0.8),
            ctx("a2", "A", "Alpha two.", 0.95),
            ctx("c1", "C", "Gamma.", 0.1),
        ];
        let (chunks, citations) = assemble(merged, 2);
        let markers: Vec<&str> = citations.iter().map(|c| c.marker.as_str()).collect();
        assert_eq!(markers, vec!["[1]", "[2]", "[3]"]);
        let docs: Vec<&str> = citations.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(docs, vec!["A", "B", "C"]);
        assert_eq!(citations[0].chunk_id, "a2");
        assert_eq!(citations[0].supporting_chunk_ids, vec!["a1".to_string()]);
        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1", "b1", "c1"]);
    }

    #[test]
    fn supporting_chunks_are_capped() {
        let merged = (0..5)
            .map(|i| ctx(&format!("c{i}"), "D", "Text.", 1.0 - i as f64 * 0.1))
            .collect();
        let (chunks, citations) = assemble(merged, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].supporting_chunk_ids.len(), 2);
    }

    #[test]
    fn page_span_covers_group() {
        let mut first = chunk("x1", "D", "One.");
        first.page_start = Some(4);
        first.page_end = Some(5);
        first.section = Some("Intro".to_string());
        let mut second = chunk("x2", "D", "Two.");
        second.page_start = Some(2);
        let (_, citations) = assemble(
            vec![
                ContextChunk::retrieved(first, 0.9),
                ContextChunk::retrieved(second, 0.5),
            ],
            2,
        );
        assert_eq!(citations[0].page_start, Some(2));
        assert_eq!(citations[0].page_end, Some(5));
        assert_eq!(citations[0].section.as_deref(), Some("Intro"));
    }

    #[test]
    fn summary_is_first_sentence_and_bounded() {
        assert_eq!(
            fact_summary("Leia builds 3D displays. Founded in 2014."),
            "Leia builds 3D displays."
        );
        assert_eq!(fact_summary("Version 1.5 shipped\nlate"), "Version 1.5 shipped late");
        let long = "word ".repeat(100);
        assert!(fact_summary(&long).chars().count() <= MAX_SUMMARY_CHARS);
    }

    #[test]
    fn duplicate_chunk_ids_collapse() {
        let (chunks, citations) = assemble(
            vec![ctx("a", "A", "x.", 0.4), ctx("a", "A", "x.", 0.4)],
            2,
        );
        assert_eq!(chunks.len(), 1);
        assert!(citations[0].supporting_chunk_ids.is_empty());
    }
}
