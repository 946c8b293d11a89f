//! Cache of translated queries.
//!
//! Queries are immutable values, so a translation can be reused whenever an
//! equal query is executed again against the same schema and dialect.

use std::collections::HashMap;

use crate::query::Query;
use crate::translate::{Translated, Translator};
use corral_core::{Dialect, Result};

#[derive(Debug, Clone)]
struct CachedTranslation {
    translated: Translated,
    last_used: u64,
    hit_count: u64,
}

/// LRU-style cache of [`Translated`] queries.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct TranslationCache {
    entries: HashMap<String, CachedTranslation>,
    max_size: usize,
    clock: u64,
}

/// Cache key covering every field of the query, literal values included.
pub fn cache_key(query: &Query, dialect: Dialect) -> String {
    format!("{dialect:?}|{query:?}")
}

impl TranslationCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size.min(256)),
            max_size,
            clock: 0,
        }
    }

    /// Get a cached translation or translate and insert it.
    #[allow(clippy::result_large_err)]
    pub fn get_or_translate(
        &mut self,
        translator: &Translator<'_>,
        dialect: Dialect,
        query: &Query,
    ) -> Result<Translated> {
        self.clock += 1;
        let key = cache_key(query, dialect);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = self.clock;
            entry.hit_count += 1;
            return Ok(entry.translated.clone());
        }

        let translated = translator.translate(query)?;
        if self.max_size == 0 {
            return Ok(translated);
        }
        if self.entries.len() >= self.max_size {
            self.evict_lru();
        }
        self.entries.insert(
            key,
            CachedTranslation {
                translated: translated.clone(),
                last_used: self.clock,
                hit_count: 0,
            },
        );
        Ok(translated)
    }

    pub fn contains(&self, query: &Query, dialect: Dialect) -> bool {
        self.entries.contains_key(&cache_key(query, dialect))
    }

    /// Number of times a cached translation of `query` was reused.
    pub fn hits(&self, query: &Query, dialect: Dialect) -> u64 {
        self.entries
            .get(&cache_key(query, dialect))
            .map_or(0, |e| e.hit_count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::var;
    use corral_core::{Attribute, EntityDef, Schema, SqlType};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("age", SqlType::Integer)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn equal_queries_hit() {
        let schema = schema();
        let translator = Translator::new(&schema, Dialect::Sqlite);
        let mut cache = TranslationCache::new(10);
        let q = Query::select("p", "Person").filter(var("p").attr("age").gt(20));
        let first = cache.get_or_translate(&translator, Dialect::Sqlite, &q).unwrap();
        let again = Query::select("p", "Person").filter(var("p").attr("age").gt(20));
        let second = cache
            .get_or_translate(&translator, Dialect::Sqlite, &again)
            .unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(&q, Dialect::Sqlite), 1);
    }

    #[test]
    fn different_literals_miss() {
        let schema = schema();
        let translator = Translator::new(&schema, Dialect::Sqlite);
        let mut cache = TranslationCache::new(10);
        let a = Query::select("p", "Person").filter(var("p").attr("age").gt(20));
        let b = Query::select("p", "Person").filter(var("p").attr("age").gt(30));
        cache.get_or_translate(&translator, Dialect::Sqlite, &a).unwrap();
        let translated = cache.get_or_translate(&translator, Dialect::Sqlite, &b).unwrap();
        assert_eq!(translated.params, vec![corral_core::Value::Int(30)]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let schema = schema();
        let translator = Translator::new(&schema, Dialect::Sqlite);
        let mut cache = TranslationCache::new(2);
        let q1 = Query::select("p", "Person").limit(1);
        let q2 = Query::select("p", "Person").limit(2);
        let q3 = Query::select("p", "Person").limit(3);
        cache.get_or_translate(&translator, Dialect::Sqlite, &q1).unwrap();
        cache.get_or_translate(&translator, Dialect::Sqlite, &q2).unwrap();
        cache.get_or_translate(&translator, Dialect::Sqlite, &q1).unwrap();
        cache.get_or_translate(&translator, Dialect::Sqlite, &q3).unwrap();
        assert!(cache.contains(&q1, Dialect::Sqlite));
        assert!(!cache.contains(&q2, Dialect::Sqlite));
        assert!(cache.contains(&q3, Dialect::Sqlite));
    }

    #[test]
    fn errors_are_not_cached() {
        let schema = schema();
        let translator = Translator::new(&schema, Dialect::Sqlite);
        let mut cache = TranslationCache::default();
        let bad = Query::select("p", "Person").filter(var("p").attr("nope").gt(1));
        assert!(cache.get_or_translate(&translator, Dialect::Sqlite, &bad).is_err());
        assert!(cache.is_empty());
    }
}
