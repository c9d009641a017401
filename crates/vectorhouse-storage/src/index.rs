//! In-Memory Document Index
//!
//! Thread-safe map of doc id → document with brute-force similarity
//! search. Readers share the lock; writers exclude them only for the
//! duration of a map mutation, so `search`/`get` stay cheap and
//! contention lives entirely on the write path.
//!
//! Search scores every document with a dot product against the query
//! (cosine similarity when both vectors are unit-norm), sorts descending
//! and truncates. There is no ANN structure here: the whole index is
//! in-memory and the caller bounds the document count.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vectorhouse_core::{Document, Embedding};

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub score: f32,
    pub title: String,
    pub text: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe in-memory index of documents.
#[derive(Debug, Default)]
pub struct MemIndex {
    docs: RwLock<HashMap<String, Document>>,
}

impl MemIndex {
    pub fn new() -> MemIndex {
        MemIndex::default()
    }

    /// Insert or replace a document.
    pub fn set(&self, doc: Document) {
        let mut docs = self.docs.write().unwrap();
        docs.insert(doc.id.clone(), doc);
    }

    /// Insert or replace a document during WAL replay. Behaves exactly
    /// like [`set`](Self::set); the separate name keeps recovery call
    /// sites distinguishable from live writes.
    pub fn set_recovered(&self, doc: Document) {
        self.set(doc);
    }

    /// Remove a document. Removing an absent id is a no-op.
    pub fn delete(&self, doc_id: &str) {
        let mut docs = self.docs.write().unwrap();
        docs.remove(doc_id);
    }

    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.docs.read().unwrap().get(doc_id).cloned()
    }

    pub fn has(&self, doc_id: &str) -> bool {
        self.docs.read().unwrap().contains_key(doc_id)
    }

    pub fn count(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    /// All documents, copied out.
    pub fn all(&self) -> Vec<Document> {
        self.docs.read().unwrap().values().cloned().collect()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.docs.read().unwrap().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.docs.write().unwrap().clear();
    }

    /// Visit documents until the callback returns `false`.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Document) -> bool,
    {
        let docs = self.docs.read().unwrap();
        for (id, doc) in docs.iter() {
            if !f(id, doc) {
                break;
            }
        }
    }

    /// Deep copy of the index.
    pub fn clone_index(&self) -> MemIndex {
        MemIndex {
            docs: RwLock::new(self.docs.read().unwrap().clone()),
        }
    }

    /// Brute-force top-k similarity search. `limit == 0` returns every
    /// document, still sorted by score descending.
    pub fn search(&self, query: &Embedding, limit: usize) -> Vec<SearchResult> {
        let docs = self.docs.read().unwrap();
        if docs.is_empty() {
            return Vec::new();
        }

        let mut results: Vec<SearchResult> = docs
            .values()
            .map(|doc| SearchResult {
                doc_id: doc.id.clone(),
                score: query.dot(&doc.embedding),
                title: doc.title.clone(),
                text: doc.text.clone(),
                source: doc.source.clone(),
                metadata: doc.metadata.clone(),
                created_at: doc.created_at,
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if limit > 0 && limit < results.len() {
            results.truncate(limit);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, title: &str, embed_from: &str) -> Document {
        Document {
            id: id.to_string(),
            source: "test".to_string(),
            title: title.to_string(),
            text: format!("text of {id}"),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            embedding: Embedding::deterministic(embed_from),
        }
    }

    #[test]
    fn test_set_get_has_count() {
        let index = MemIndex::new();
        assert_eq!(index.count(), 0);
        assert!(!index.has("a"));

        index.set(doc("a", "A", "a"));
        assert_eq!(index.count(), 1);
        assert!(index.has("a"));
        assert_eq!(index.get("a").unwrap().title, "A");
        assert!(index.get("b").is_none());
    }

    #[test]
    fn test_set_replaces() {
        let index = MemIndex::new();
        index.set(doc("a", "v1", "a"));
        index.set(doc("a", "v2", "a"));
        assert_eq!(index.count(), 1);
        assert_eq!(index.get("a").unwrap().title, "v2");
    }

    #[test]
    fn test_delete() {
        let index = MemIndex::new();
        index.set(doc("a", "A", "a"));
        index.delete("a");
        assert_eq!(index.count(), 0);
        // Deleting again is harmless.
        index.delete("a");
    }

    #[test]
    fn test_all_and_all_ids() {
        let index = MemIndex::new();
        index.set(doc("a", "A", "a"));
        index.set(doc("b", "B", "b"));
        assert_eq!(index.all().len(), 2);
        let mut ids = index.all_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_clear() {
        let index = MemIndex::new();
        index.set(doc("a", "A", "a"));
        index.clear();
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_range_can_stop_early() {
        let index = MemIndex::new();
        for i in 0..10 {
            index.set(doc(&format!("d{i}"), "t", "e"));
        }
        let mut visited = 0;
        index.range(|_, _| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_clone_index_is_independent() {
        let index = MemIndex::new();
        index.set(doc("a", "A", "a"));
        let snapshot = index.clone_index();
        index.delete("a");
        assert_eq!(index.count(), 0);
        assert_eq!(snapshot.count(), 1);
    }

    #[test]
    fn test_search_ranks_exact_match_first() {
        let index = MemIndex::new();
        index.set(doc("a", "hello", "hello world"));
        index.set(doc("b", "goodbye", "goodbye world"));
        index.set(doc("c", "other", "something else"));

        let query = Embedding::deterministic("hello world");
        let results = index.search(&query, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].doc_id, "a");
        assert!(results[0].score >= 0.999);
        assert!(results[0].score >= results[1].score);
        assert!(results[1].score >= results[2].score);
    }

    #[test]
    fn test_search_limit_zero_returns_all() {
        let index = MemIndex::new();
        for i in 0..5 {
            index.set(doc(&format!("d{i}"), "t", &format!("e{i}")));
        }
        assert_eq!(index.search(&Embedding::deterministic("q"), 0).len(), 5);
        assert_eq!(index.search(&Embedding::deterministic("q"), 2).len(), 2);
    }

    #[test]
    fn test_search_empty_index() {
        let index = MemIndex::new();
        assert!(index.search(&Embedding::deterministic("q"), 10).is_empty());
    }

    #[test]
    fn test_search_scores_within_unit_bounds() {
        let index = MemIndex::new();
        for i in 0..20 {
            index.set(doc(&format!("d{i}"), "t", &format!("embed {i}")));
        }
        let results = index.search(&Embedding::deterministic("query"), 0);
        for r in results {
            assert!(r.score <= 1.0 + 1e-3 && r.score >= -1.0 - 1e-3, "{}", r.score);
        }
    }
}
