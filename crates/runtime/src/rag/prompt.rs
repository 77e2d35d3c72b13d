//! Context selection and prompt assembly for retrieval-augmented answers.

use serde_json::Value;

use crate::engines::ScoredHit;

/// Unary context caps: a single short snippet keeps answers grounded and the
/// prompt small.
pub const DEFAULT_MAX_DOCS: usize = 1;
pub const DEFAULT_PER_DOC_MAX_CHARS: usize = 180;
pub const DEFAULT_TOTAL_MAX_CHARS: usize = 480;

/// Below this total context length the stream path falls back to plain
/// generation.
pub const SHORT_CIRCUIT_MIN_CHARS: usize = 80;

/// Standard answer when retrieval produced nothing usable.
pub const NO_INFO_ANSWER: &str = "未在文档中找到相关信息";

/// Contexts retained for the prompt plus the aligned source descriptors.
#[derive(Debug, Default)]
pub struct ContextBundle {
    pub contexts: Vec<String>,
    pub sources: Vec<Value>,
}

impl ContextBundle {
    pub fn total_chars(&self) -> usize {
        self.contexts.iter().map(|c| c.chars().count()).sum()
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Walk scored points in score order, deduplicate by payload text, truncate
/// each snippet, and stop at the document/char budgets. Sources stay aligned
/// with the retained contexts.
pub fn prepare_contexts(
    scored: &[ScoredHit],
    max_docs: usize,
    per_doc_max_chars: usize,
    total_max_chars: usize,
) -> ContextBundle {
    let mut seen = std::collections::HashSet::new();
    let mut bundle = ContextBundle::default();
    let mut total_chars = 0usize;

    for hit in scored {
        let text = hit
            .payload
            .as_ref()
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() || !seen.insert(text.to_string()) {
            continue;
        }
        let snippet = truncate_chars(text, per_doc_max_chars);
        let snippet_chars = snippet.chars().count();
        if total_chars + snippet_chars > total_max_chars {
            break;
        }
        total_chars += snippet_chars;
        bundle.contexts.push(snippet);
        bundle.sources.push(serde_json::json!({
            "id": hit.id,
            "score": hit.score,
            "payload": hit.payload.clone().unwrap_or(Value::Null),
        }));
        if bundle.contexts.len() >= max_docs {
            break;
        }
    }
    bundle
}

pub fn prepare_contexts_default(scored: &[ScoredHit]) -> ContextBundle {
    prepare_contexts(
        scored,
        DEFAULT_MAX_DOCS,
        DEFAULT_PER_DOC_MAX_CHARS,
        DEFAULT_TOTAL_MAX_CHARS,
    )
}

/// Contexts first, then the question. With no contexts the prompt is just the
/// bare question with the brevity instruction.
pub fn build_prompt(query: &str, contexts: &[String]) -> String {
    if contexts.is_empty() {
        return format!("问题：{query}\n请用不超过两句话作答。");
    }
    let ctx = contexts.join("\n\n");
    format!("上下文：{ctx}\n问题：{query}\n请仅依据上下文，用不超过两句话简洁作答。")
}

/// User-facing message for a query/collection dimension mismatch.
pub fn dimension_mismatch_message(expected: u64, got: usize) -> String {
    format!(
        "向量维度不匹配：集合期望 {expected}，查询为 {got}；请使用相同嵌入模型重建集合或切换到匹配的集合。"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::PointKey;
    use serde_json::json;

    fn hit(id: u64, score: f32, text: &str) -> ScoredHit {
        ScoredHit {
            id: PointKey::Num(id),
            score,
            payload: Some(json!({"text": text})),
        }
    }

    #[test]
    fn dedups_and_respects_doc_cap() {
        let scored = vec![hit(1, 0.9, "alpha"), hit(2, 0.8, "alpha"), hit(3, 0.7, "beta")];
        let bundle = prepare_contexts(&scored, 2, 100, 1000);
        assert_eq!(bundle.contexts, vec!["alpha", "beta"]);
        assert_eq!(bundle.sources.len(), 2);
        assert_eq!(bundle.sources[0]["id"], 1);
        assert_eq!(bundle.sources[1]["id"], 3);
    }

    #[test]
    fn skips_points_without_text() {
        let scored = vec![
            ScoredHit {
                id: PointKey::Num(1),
                score: 0.9,
                payload: Some(json!({"other": "x"})),
            },
            hit(2, 0.8, "usable"),
        ];
        let bundle = prepare_contexts_default(&scored);
        assert_eq!(bundle.contexts, vec!["usable"]);
    }

    #[test]
    fn enforces_per_doc_and_total_char_budgets() {
        let long = "x".repeat(400);
        let scored = vec![hit(1, 0.9, &long), hit(2, 0.8, "short")];
        let bundle = prepare_contexts(&scored, 5, 180, 200);
        assert_eq!(bundle.contexts.len(), 1);
        assert_eq!(bundle.contexts[0].chars().count(), 180);
        // The second snippet would blow the total budget.
        assert_eq!(bundle.total_chars(), 180);
    }

    #[test]
    fn prompt_shapes() {
        let bare = build_prompt("什么是向量？", &[]);
        assert!(bare.starts_with("问题："));
        let full = build_prompt("什么是向量？", &["向量是……".to_string()]);
        assert!(full.starts_with("上下文："));
        assert!(full.contains("问题：什么是向量？"));
    }
}
