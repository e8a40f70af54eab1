//! Offline index builder
//!
//! A batch pass over already-persisted shard/document files that produces
//! the `<name>.filter.index` and `<name>.search.index` side-files the live
//! stores merge in on load. It is independent of any live store; only the
//! file formats are shared.
//!
//! Files are parsed with a streaming `SeqAccess` visitor, so memory use is
//! bounded by one record at a time regardless of file size. Positions count
//! `null` tombstones, matching the live store's position space. Output maps
//! are BTreeMap-backed, so rebuilds of the same input are byte-identical
//! and diffable.

use crate::config::StoreConfig;
use crate::error::DocshardError;
use crate::index::{
    discover_shard_files, sibling_path, FilterIndex, SideFile, FILTER_INDEX_SUFFIX,
    SEARCH_CATEGORY, SEARCH_INDEX_SUFFIX,
};
use crate::query::{normalize_index_token, tokenize};
use crate::Result;
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fields whose raw values feed a filter category of the same name.
/// For `paths` the word is each path's full string.
pub const FILTER_CATEGORIES: &[&str] = &["devices", "devtools", "packageUId", "paths"];

/// Descriptive fields whose values are tokenized into the search category
pub const SEARCH_FIELDS: &[&str] = &[
    "paths",
    "devtools",
    "devices",
    "coreTypes",
    "tags",
    "compiler",
    "kernel",
    "description",
    "name",
];

/// Counters from one builder pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Live records scanned
    pub records: usize,
    /// `null` tombstones skipped (positions still advance past them)
    pub tombstones: usize,
    /// (category, word, position) filter entries written
    pub filter_entries: usize,
    /// (token, position) search entries written
    pub search_entries: usize,
}

/// Offline builder for filter and search index side-files
pub struct IndexBuilder {
    min_token_len: usize,
    max_token_len: usize,
}

impl IndexBuilder {
    /// Create a builder using the configuration's token bounds
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            min_token_len: config.min_token_len,
            max_token_len: config.max_token_len,
        }
    }

    /// Build both side-files for one persisted document file. A missing
    /// input file produces empty indices, mirroring load semantics.
    pub async fn build_file(&self, path: &Path) -> Result<BuildStats> {
        let input = path.to_path_buf();
        let (min, max) = (self.min_token_len, self.max_token_len);
        let collector = tokio::task::spawn_blocking(move || scan_file(&input, min, max))
            .await
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))??;

        let filter_path = sibling_path(path, FILTER_INDEX_SUFFIX);
        tokio::fs::write(&filter_path, serde_json::to_string_pretty(&collector.filter)?).await?;

        let mut search_file = SideFile::new();
        search_file.insert(SEARCH_CATEGORY.to_string(), collector.search);
        tokio::fs::write(
            sibling_path(path, SEARCH_INDEX_SUFFIX),
            serde_json::to_string_pretty(&search_file)?,
        )
        .await?;

        info!(
            input = %path.display(),
            records = collector.stats.records,
            filter_entries = collector.stats.filter_entries,
            search_entries = collector.stats.search_entries,
            "built index side-files"
        );
        Ok(collector.stats)
    }

    /// Build side-files for every shard file in a directory, skipping
    /// existing `*.index` files. Returns per-file stats keyed by name.
    pub async fn build_directory(
        &self,
        directory: &Path,
    ) -> Result<std::collections::BTreeMap<String, BuildStats>> {
        let mut results = std::collections::BTreeMap::new();
        for name in discover_shard_files(directory).await? {
            let stats = self.build_file(&directory.join(&name)).await?;
            debug!(shard = %name, records = stats.records, "indexed shard file");
            results.insert(name, stats);
        }
        Ok(results)
    }
}

struct Collector {
    min_token_len: usize,
    max_token_len: usize,
    filter: FilterIndex,
    search: std::collections::BTreeMap<String, Vec<usize>>,
    stats: BuildStats,
}

impl Collector {
    fn new(min_token_len: usize, max_token_len: usize) -> Self {
        Self {
            min_token_len,
            max_token_len,
            filter: FilterIndex::new(),
            search: Default::default(),
            stats: BuildStats::default(),
        }
    }

    fn add_record(&mut self, position: usize, record: &Value) {
        let Some(object) = record.as_object() else {
            self.stats.tombstones += 1;
            return;
        };
        self.stats.records += 1;

        for &category in FILTER_CATEGORIES {
            let mut words = BTreeSet::new();
            if let Some(value) = object.get(category) {
                collect_words(value, &mut words);
            }
            for word in words {
                self.filter
                    .entry(category.to_string())
                    .or_default()
                    .entry(word)
                    .or_default()
                    .push(position);
                self.stats.filter_entries += 1;
            }
        }

        // Deduplicate per record, so a token appearing in several fields
        // records the position once.
        let mut tokens = BTreeSet::new();
        for &field in SEARCH_FIELDS {
            if let Some(value) = object.get(field) {
                let mut words = BTreeSet::new();
                collect_words(value, &mut words);
                for word in words {
                    for token in tokenize(&word) {
                        if let Some(token) =
                            normalize_index_token(&token, self.min_token_len, self.max_token_len)
                        {
                            tokens.insert(token);
                        }
                    }
                }
            }
        }
        for token in tokens {
            self.search.entry(token).or_default().push(position);
            self.stats.search_entries += 1;
        }
    }
}

/// Collect a field's candidate words: the scalar's string form, recursing
/// through arrays and arrays-of-arrays. Objects contribute nothing.
fn collect_words(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            out.insert(s.clone());
        }
        Value::Number(n) => {
            out.insert(n.to_string());
        }
        Value::Bool(b) => {
            out.insert(b.to_string());
        }
        Value::Array(items) => {
            for item in items {
                collect_words(item, out);
            }
        }
        Value::Null | Value::Object(_) => {}
    }
}

struct SequenceVisitor<'a> {
    collector: &'a mut Collector,
}

impl<'de> Visitor<'de> for SequenceVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a JSON array of documents")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut position = 0usize;
        while let Some(record) = seq.next_element::<Value>()? {
            self.collector.add_record(position, &record);
            position += 1;
        }
        Ok(())
    }
}

fn scan_file(path: &PathBuf, min_token_len: usize, max_token_len: usize) -> Result<Collector> {
    let mut collector = Collector::new(min_token_len, max_token_len);
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(collector),
        Err(e) => return Err(e.into()),
    };

    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    deserializer
        .deserialize_seq(SequenceVisitor {
            collector: &mut collector,
        })
        .map_err(DocshardError::from)?;
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(records: &[Value]) -> Collector {
        let mut collector = Collector::new(3, 40);
        for (position, record) in records.iter().enumerate() {
            collector.add_record(position, record);
        }
        collector
    }

    #[test]
    fn test_filter_categories_use_raw_values() {
        let collector = collect(&[json!({
            "packageUId": "pkgA.1.0.0",
            "devices": ["R7FA6M3", ["R7FA2L1"]],
            "devtools": "e2studio",
            "name": "sample"
        })]);

        let devices = &collector.filter["devices"];
        assert_eq!(devices["R7FA6M3"], vec![0]);
        assert_eq!(devices["R7FA2L1"], vec![0]);
        assert_eq!(collector.filter["packageUId"]["pkgA.1.0.0"], vec![0]);
        assert_eq!(collector.filter["devtools"]["e2studio"], vec![0]);
        assert!(!collector.filter.contains_key("name"));
    }

    #[test]
    fn test_paths_full_string_filter_but_tokenized_search() {
        let collector = collect(&[json!({
            "paths": ["src/hal/adc_driver.c"]
        })]);

        assert_eq!(collector.filter["paths"]["src/hal/adc_driver.c"], vec![0]);
        assert!(collector.search.contains_key("src"));
        assert!(collector.search.contains_key("hal"));
        assert!(collector.search.contains_key("adc"));
        assert!(collector.search.contains_key("driver.c"));
    }

    #[test]
    fn test_search_token_rules_applied() {
        let collector = collect(&[json!({
            "description": "An ADC demo. See .config y ---",
            "name": "x"
        })]);

        // "an" and "y" fall under the minimum length, "x" too,
        // "---" has no word character, ".config" loses its leading dot
        assert!(collector.search.contains_key("adc"));
        assert!(collector.search.contains_key("demo."));
        assert!(collector.search.contains_key("config"));
        assert!(collector.search.contains_key("see"));
        assert!(!collector.search.contains_key("an"));
        assert!(!collector.search.contains_key("y"));
        assert!(!collector.search.contains_key("---"));
    }

    #[test]
    fn test_positions_count_tombstones() {
        let collector = collect(&[
            json!(null),
            json!({"devices": "R7FA6M3"}),
            json!(null),
            json!({"devices": "R7FA6M3"}),
        ]);

        assert_eq!(collector.stats.records, 2);
        assert_eq!(collector.stats.tombstones, 2);
        assert_eq!(collector.filter["devices"]["R7FA6M3"], vec![1, 3]);
    }

    #[test]
    fn test_token_deduplicated_per_record() {
        let collector = collect(&[json!({
            "name": "adc_demo",
            "description": "adc demo for adc peripherals"
        })]);
        assert_eq!(collector.search["adc"], vec![0]);
        assert_eq!(collector.search["demo"], vec![0]);
    }
}
