use crate::page::{PageResolution, ResolutionMethod};
use crate::retriever::Candidate;
use pagecite_core::model::ChunkId;
use pagecite_core::text::collapse_whitespace;
use serde::Serialize;
use std::cmp::Ordering;

const ELLIPSIS: char = '…';

/// A candidate whose page has been resolved.
#[derive(Debug, Clone)]
pub struct AttributedCandidate {
    pub candidate: Candidate,
    pub resolution: PageResolution,
    /// Display name of the source document.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub source: String,
    pub page: u32,
    pub page_confidence: f32,
    pub similarity_score: f32,
    /// Relative to the other citations of the same response. Absent when every score is equal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_percentage: Option<f32>,
    pub snippet: String,
    #[serde(skip)]
    pub chunk_id: ChunkId,
    #[serde(skip)]
    pub document_id: String,
    #[serde(skip)]
    pub resolution_method: ResolutionMethod,
    #[serde(skip)]
    pub source_confidence: f32,
}

pub struct CitationRanker {
    snippet_chars: usize,
}

impl CitationRanker {
    pub fn new(snippet_chars: usize) -> Self {
        Self { snippet_chars }
    }

    /// Order attributed candidates into citations. `query_terms` positions the snippets.
    pub fn rank(&self, mut items: Vec<AttributedCandidate>, query_terms: &[String]) -> Vec<Citation> {
        items.sort_by(citation_order);

        let scores: Vec<f32> = items.iter().map(|item| item.candidate.similarity()).collect();
        let percentages = similarity_percentages(&scores);

        items
            .into_iter()
            .zip(percentages)
            .map(|(item, similarity_percentage)| {
                let chunk = &item.candidate.chunk;
                Citation {
                    snippet: snippet(&chunk.text, query_terms, self.snippet_chars),
                    chunk_id: chunk.id,
                    document_id: chunk.document_id.clone(),
                    source: item.source,
                    page: item.resolution.page,
                    page_confidence: item.resolution.confidence,
                    similarity_score: item.candidate.similarity(),
                    similarity_percentage,
                    resolution_method: item.resolution.method,
                    source_confidence: item.candidate.source_confidence(),
                }
            })
            .collect()
    }
}

/// Similarity desc, page confidence desc, source confidence desc, retrieval order asc, chunk id asc.
fn citation_order(a: &AttributedCandidate, b: &AttributedCandidate) -> Ordering {
    let desc = |x: f32, y: f32| y.partial_cmp(&x).unwrap_or(Ordering::Equal);
    desc(a.candidate.similarity(), b.candidate.similarity())
        .then_with(|| desc(a.resolution.confidence, b.resolution.confidence))
        .then_with(|| desc(a.candidate.source_confidence(), b.candidate.source_confidence()))
        .then_with(|| {
            a.candidate
                .retrieval_order()
                .cmp(&b.candidate.retrieval_order())
        })
        .then_with(|| a.candidate.id().cmp(&b.candidate.id()))
}

/// `(score - worst) / (best - worst) * 100` per score, or `None` for all when
/// best equals worst.
pub fn similarity_percentages(scores: &[f32]) -> Vec<Option<f32>> {
    let best = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let worst = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let range = best - worst;
    if scores.is_empty() || !range.is_finite() || range <= f32::EPSILON {
        return vec![None; scores.len()];
    }
    scores
        .iter()
        .map(|score| Some(((score - worst) / range * 100.0).clamp(0.0, 100.0)))
        .collect()
}

/// Whitespace-collapsed window of `text` of at most `max_chars` characters,
/// starting shortly before the first query-term hit. Zero disables the cut.
pub fn snippet(text: &str, query_terms: &[String], max_chars: usize) -> String {
    let collapsed = collapse_whitespace(text);
    let chars: Vec<char> = collapsed.chars().collect();
    if max_chars == 0 || chars.len() <= max_chars {
        return collapsed;
    }

    let lead = max_chars / 4;
    let mut start = first_hit(&chars, query_terms)
        .map_or(0, |hit| hit.saturating_sub(lead))
        .min(chars.len() - max_chars);
    if start > 0 {
        // Do not open on a partial word.
        if let Some(space) = chars[start..].iter().position(|c| *c == ' ') {
            if space < lead.max(1) {
                start += space + 1;
            }
        }
    }

    let body_len = max_chars.saturating_sub(usize::from(start > 0) + 1).max(1);
    let mut end = (start + body_len).min(chars.len());
    if end < chars.len() {
        if let Some(space) = chars[start..end].iter().rposition(|c| *c == ' ') {
            if space > body_len / 2 {
                end = start + space;
            }
        }
    }

    let mut out = String::with_capacity(max_chars * 4);
    if start > 0 {
        out.push(ELLIPSIS);
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push(ELLIPSIS);
    }
    out
}

/// Char index of the earliest word-initial match of any query term.
fn first_hit(chars: &[char], query_terms: &[String]) -> Option<usize> {
    let lowered: Vec<char> = chars
        .iter()
        .map(|c| c.to_lowercase().next().unwrap_or(*c))
        .collect();

    query_terms
        .iter()
        .filter_map(|term| {
            let needle: Vec<char> = term.chars().collect();
            if needle.is_empty() || needle.len() > lowered.len() {
                return None;
            }
            (0..=lowered.len() - needle.len()).find(|&pos| {
                lowered[pos..pos + needle.len()] == needle[..]
                    && (pos == 0 || !lowered[pos - 1].is_alphanumeric() || !needle[0].is_ascii())
            })
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::ScoreChannel;
    use pagecite_core::model::Chunk;
    use std::sync::Arc;

    fn attributed(id: u64, score: f32, page_confidence: f32, channel: ScoreChannel) -> AttributedCandidate {
        AttributedCandidate {
            candidate: Candidate {
                chunk: Arc::new(Chunk::new(id, "doc", format!("chunk {id}"), vec![1.0], 0, 10)),
                raw_score: score,
                channel,
                sub_query_index: 0,
                retrieval_rank: id as usize,
                semantic_score: None,
                keyword_score: None,
                rerank_score: None,
            },
            resolution: PageResolution {
                page: 1,
                confidence: page_confidence,
                method: ResolutionMethod::CharOverlap,
                clamped: false,
                spans_multiple_pages: false,
                corrections: Vec::new(),
            },
            source: "doc.pdf".to_string(),
        }
    }

    fn ranker() -> CitationRanker {
        CitationRanker::new(240)
    }

    #[test]
    fn percentages_are_relative_to_best_and_worst() {
        let items = vec![
            attributed(3, 0.70, 1.0, ScoreChannel::Hybrid),
            attributed(1, 0.91, 1.0, ScoreChannel::Hybrid),
            attributed(2, 0.85, 1.0, ScoreChannel::Hybrid),
        ];

        let citations = ranker().rank(items, &[]);
        let ids: Vec<u64> = citations.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let percentages: Vec<f32> = citations
            .iter()
            .map(|c| c.similarity_percentage.unwrap())
            .collect();
        assert!((percentages[0] - 100.0).abs() < 1e-3);
        assert!((percentages[1] - 71.428_57).abs() < 1e-2);
        assert!(percentages[2].abs() < 1e-3);
    }

    #[test]
    fn equal_scores_have_no_percentage() {
        let items = (1..=4)
            .map(|id| attributed(id, 0.5, 1.0, ScoreChannel::Hybrid))
            .collect();
        let citations = ranker().rank(items, &[]);
        assert_eq!(citations.len(), 4);
        assert!(citations.iter().all(|c| c.similarity_percentage.is_none()));

        let single = ranker().rank(vec![attributed(9, 0.8, 1.0, ScoreChannel::Hybrid)], &[]);
        assert_eq!(single[0].similarity_percentage, None);
        assert!(ranker().rank(Vec::new(), &[]).is_empty());
    }

    #[test]
    fn ties_break_on_page_then_source_confidence_then_retrieval_order() {
        let items = vec![
            attributed(5, 0.5, 0.6, ScoreChannel::Hybrid),
            attributed(4, 0.5, 1.0, ScoreChannel::Keyword),
            attributed(3, 0.5, 1.0, ScoreChannel::Hybrid),
            attributed(2, 0.5, 0.6, ScoreChannel::Hybrid),
        ];
        let ids: Vec<u64> = ranker()
            .rank(items, &[])
            .iter()
            .map(|c| c.chunk_id)
            .collect();
        assert_eq!(ids, vec![3, 4, 2, 5]);
    }

    #[test]
    fn absent_percentage_is_omitted_from_json() {
        let citations = ranker().rank(vec![attributed(1, 0.4, 0.9, ScoreChannel::Semantic)], &[]);
        let json = serde_json::to_value(&citations[0]).unwrap();
        assert!(json.get("similarity_percentage").is_none());
        assert_eq!(json["source"], "doc.pdf");
        assert_eq!(json["page"], 1);
        assert!(json.get("chunk_id").is_none());
    }

    #[test]
    fn snippet_starts_near_first_term_hit() {
        let text = format!("{} The battery warranty covers eight years. {}", "intro ".repeat(60), "tail ".repeat(60));
        let snippet = snippet(&text, &["warranty".to_string()], 80);

        assert!(snippet.starts_with(ELLIPSIS));
        assert!(snippet.ends_with(ELLIPSIS));
        assert!(snippet.contains("warranty"));
        assert!(snippet.chars().count() <= 80);
    }

    #[test]
    fn short_text_is_only_whitespace_collapsed() {
        assert_eq!(snippet("  a \n\n b  ", &[], 240), "a b");
        assert_eq!(snippet("abc def", &[], 0), "abc def");
    }

    #[test]
    fn snippet_cuts_on_char_boundaries() {
        let text = "電池の保証は八年です。".repeat(40);
        let snippet = snippet(&text, &["保証".to_string()], 30);
        assert!(snippet.chars().count() <= 30);
        assert!(snippet.contains("保証"));
    }
}
