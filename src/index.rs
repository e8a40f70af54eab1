//! Index tables and on-disk index formats
//!
//! Three index shapes exist:
//!
//! - the id index (`_id` string form → position), the only index maintained
//!   incrementally in memory;
//! - filter indices (field → value string form → sorted position list);
//! - the search index (lowercased token → sorted position list).
//!
//! Persisted as JSON with BTreeMap-backed objects throughout, so every
//! serialization is deterministically key-ordered and rebuilds are diffable.
//! `<name>.index` holds the id index plus the merged filter/search tables;
//! the offline builder's side-files `<name>.filter.index` and
//! `<name>.search.index` are merged in on load (or on `load_indices`).
//!
//! Filter and search indices are never patched on mutation: an insert,
//! update, or upsert drops them outright, and after a removal they may
//! reference tombstoned positions, which readers treat as misses.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Suffix of the merged per-store index file
pub const INDEX_SUFFIX: &str = ".index";

/// Suffix of the builder's filter-index side-file
pub const FILTER_INDEX_SUFFIX: &str = ".filter.index";

/// Suffix of the builder's search-index side-file
pub const SEARCH_INDEX_SUFFIX: &str = ".search.index";

/// Category key the search index is stored under when merged
pub const SEARCH_CATEGORY: &str = "search";

/// Sorted, duplicate-free sequence of document positions
pub type PositionList = Vec<usize>;

/// field/category → value string form → positions
pub type FilterIndex = BTreeMap<String, BTreeMap<String, PositionList>>;

/// lowercased token → positions
pub type SearchIndex = BTreeMap<String, PositionList>;

/// On-disk shape of `<name>.index`: the id index under `_id`, every other
/// top-level key being one merged filter/search category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(rename = "_id", default)]
    pub id: BTreeMap<String, usize>,
    #[serde(flatten)]
    pub categories: FilterIndex,
}

/// On-disk shape of both builder side-files: category → word → positions.
/// The search side-file carries a single `search` category.
pub type SideFile = FilterIndex;

/// Derive a sibling path by appending a suffix to the file name, e.g.
/// `dir/pkgA.1.0.0` → `dir/pkgA.1.0.0.index`. Shard uids contain dots, so
/// extension-based helpers are not usable here.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Document files in a store directory, in sorted order: every regular file
/// except the `.index` family.
pub(crate) async fn discover_shard_files(directory: &Path) -> Result<Vec<String>> {
    let mut uids = Vec::new();
    let mut entries = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.ends_with(INDEX_SUFFIX) {
                uids.push(name.to_string());
            }
        }
    }
    uids.sort();
    Ok(uids)
}

/// Intersect two sorted duplicate-free position lists
pub fn intersect_sorted(a: &[usize], b: &[usize]) -> PositionList {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Union two sorted duplicate-free position lists
pub fn union_sorted(a: &[usize], b: &[usize]) -> PositionList {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Positions for one token in the search index: the union across every
/// index key containing the token as a substring (prefix/substring
/// expansion, OR across matching keys).
pub fn search_token_positions(index: &SearchIndex, token: &str) -> PositionList {
    let mut result = PositionList::new();
    for (key, positions) in index {
        if key.contains(token) {
            result = union_sorted(&result, positions);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_sorted() {
        assert_eq!(intersect_sorted(&[1, 3, 5, 9], &[2, 3, 9, 12]), vec![3, 9]);
        assert_eq!(intersect_sorted(&[], &[1, 2]), Vec::<usize>::new());
        assert_eq!(intersect_sorted(&[4, 7], &[4, 7]), vec![4, 7]);
    }

    #[test]
    fn test_union_sorted() {
        assert_eq!(union_sorted(&[1, 5], &[2, 5, 8]), vec![1, 2, 5, 8]);
        assert_eq!(union_sorted(&[], &[3]), vec![3]);
        assert_eq!(union_sorted(&[3], &[]), vec![3]);
    }

    #[test]
    fn test_search_token_substring_expansion() {
        let mut index = SearchIndex::new();
        index.insert("cortex".into(), vec![0, 2]);
        index.insert("cortex.m4".into(), vec![1]);
        index.insert("gpio".into(), vec![3]);

        assert_eq!(search_token_positions(&index, "cortex"), vec![0, 1, 2]);
        assert_eq!(search_token_positions(&index, "tex"), vec![0, 1, 2]);
        assert_eq!(search_token_positions(&index, "m4"), vec![1]);
        assert!(search_token_positions(&index, "uart").is_empty());
    }

    #[test]
    fn test_sibling_path_keeps_dotted_names() {
        let path = Path::new("/data/pkgA.1.0.0");
        assert_eq!(
            sibling_path(path, INDEX_SUFFIX),
            PathBuf::from("/data/pkgA.1.0.0.index")
        );
        assert_eq!(
            sibling_path(path, SEARCH_INDEX_SUFFIX),
            PathBuf::from("/data/pkgA.1.0.0.search.index")
        );
    }

    #[test]
    fn test_index_file_round_trip_shape() {
        let mut file = IndexFile::default();
        file.id.insert("7".into(), 0);
        file.categories
            .entry("devices".into())
            .or_default()
            .insert("R7FA6M3".into(), vec![0, 4]);

        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"_id\""));
        assert!(json.contains("\"devices\""));
        let back: IndexFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_index_file_keys_are_ordered() {
        let mut file = IndexFile::default();
        file.categories.entry("zeta".into()).or_default();
        file.categories.entry("alpha".into()).or_default();
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
    }
}
