//! Keyword search support: FTS5 query sanitization and a simple in-memory
//! keyword -> memory-id index backing the Cache Tier's keyword domain and
//! the ANN-unavailable fallback path of the Retrieval Pipeline.

use std::collections::{HashMap, HashSet};

/// Escape a raw user query for safe use inside an FTS5 `MATCH` clause.
///
/// FTS5 query syntax treats `"`, `*`, `:`, `(`, `)`, `-`, `^` as operators;
/// wrapping each token in double quotes and doubling any embedded quote
/// neutralizes them, turning the query into a plain AND-of-tokens match.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokenize text into lowercase alphanumeric keyword tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// In-memory keyword -> memory-id index, mirroring Storage's FTS table so
/// the Cache Tier can answer `search_by_content` without a DB round trip.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    index: HashMap<String, HashSet<String>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a memory's content under each of its keyword tokens.
    pub fn insert(&mut self, memory_id: &str, content: &str) {
        for token in tokenize(content) {
            self.index.entry(token).or_default().insert(memory_id.to_string());
        }
    }

    /// Remove a memory from every token bucket it was indexed under.
    pub fn remove(&mut self, memory_id: &str) {
        self.index.retain(|_, ids| {
            ids.remove(memory_id);
            !ids.is_empty()
        });
    }

    /// Return candidate memory ids matching any of the given tokens, most
    /// frequently-matched first.
    pub fn search(&self, tokens: &[String], limit: usize) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in tokens {
            if let Some(ids) = self.index.get(token.as_str()) {
                for id in ids {
                    *counts.entry(id.as_str()).or_default() += 1;
                }
            }
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().take(limit).map(|(id, _)| id.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_wraps_each_token_in_quotes() {
        assert_eq!(sanitize_fts5_query("hello world"), "\"hello\" \"world\"");
    }

    #[test]
    fn sanitize_escapes_embedded_quotes() {
        assert_eq!(sanitize_fts5_query("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn keyword_index_finds_inserted_memory() {
        let mut idx = KeywordIndex::new();
        idx.insert("m1", "work stress today");
        let hits = idx.search(&["work".to_string()], 10);
        assert_eq!(hits, vec!["m1".to_string()]);
    }

    #[test]
    fn keyword_index_remove_clears_entry() {
        let mut idx = KeywordIndex::new();
        idx.insert("m1", "hello world");
        idx.remove("m1");
        assert!(idx.search(&["hello".to_string()], 10).is_empty());
    }

    #[test]
    fn ranks_by_number_of_matching_tokens() {
        let mut idx = KeywordIndex::new();
        idx.insert("m1", "offer job interview");
        idx.insert("m2", "offer");
        let hits = idx.search(&["offer".to_string(), "job".to_string()], 10);
        assert_eq!(hits[0], "m1");
    }
}
