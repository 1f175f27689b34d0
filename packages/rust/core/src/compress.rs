//! Keyword-aware document compressor.
//!
//! Token counts are estimated at four characters per token. Oversized
//! documents are cut into paragraphs, scored by query-term hits, and the
//! best paragraphs are kept in their original order until the budget is
//! spent.

use async_trait::async_trait;

use repoqa_shared::{CompressedDocument, DocumentCompressor};

/// Rough token estimate for English prose and code.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Default [`DocumentCompressor`] used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordCompressor;

#[async_trait]
impl DocumentCompressor for KeywordCompressor {
    async fn compress(&self, content: &str, query: &str, token_budget: usize) -> CompressedDocument {
        compress_text(content, query, token_budget)
    }
}

/// Synchronous core of [`KeywordCompressor`].
pub fn compress_text(content: &str, query: &str, token_budget: usize) -> CompressedDocument {
    let tokens = estimate_tokens(content);
    if tokens <= token_budget {
        return CompressedDocument {
            content: content.to_string(),
            token_count: tokens,
            was_compressed: false,
        };
    }

    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect();

    let paragraphs: Vec<&str> = content
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let mut scored: Vec<(usize, usize)> = paragraphs
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let lower = p.to_lowercase();
            let hits = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
            (i, hits)
        })
        .collect();
    // Most hits first; earlier paragraphs win ties.
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    // Budget in characters; the "\n\n" between kept paragraphs counts too.
    let max_chars = token_budget.saturating_mul(4);
    let best = scored.first().map(|(i, _)| *i);
    let mut keep = Vec::new();
    let mut used = 0;
    for (i, _) in scored {
        let separator = if keep.is_empty() { 0 } else { 2 };
        let cost = paragraphs[i].chars().count() + separator;
        if used + cost <= max_chars {
            keep.push(i);
            used += cost;
        }
    }
    keep.sort_unstable();

    let mut compressed = keep
        .iter()
        .map(|i| paragraphs[*i])
        .collect::<Vec<_>>()
        .join("\n\n");

    // Nothing fit whole: hard-truncate the best paragraph.
    if compressed.is_empty() {
        let source = best.map_or(content, |i| paragraphs[i]);
        compressed = truncate_chars(source, max_chars);
    }

    CompressedDocument {
        token_count: estimate_tokens(&compressed),
        content: compressed,
        was_compressed: true,
    }
}

fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => content[..idx].to_string(),
        None => content.to_string(),
    }
}
