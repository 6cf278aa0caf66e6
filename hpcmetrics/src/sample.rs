// Tagged samples: the unit of data that a registry accumulates and an exporter ships.
//
// The identity of a sample is (metric name, tag set).  Tag values are canonical strings, so any
// numeric tag (notably the reporting-bucket timestamp) must be rounded and formatted by the
// collector before it goes into a TagSet; two raw timestamps a few seconds apart are two different
// samples as far as the registry is concerned.

use serde::Serialize;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

/// A set of key/value tags.  Equality and hashing are by content: two tag sets are equal iff they
/// have the same keys and the same value for every key, regardless of the order in which the tags
/// were inserted.

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> TagSet {
        TagSet(BTreeMap::new())
    }

    /// Builder-style insert.  The value is canonicalized with `ToString`, so `42u64`, `42i64` and
    /// `"42"` all produce the same tag.

    pub fn with<V: ToString>(mut self, key: &str, value: V) -> TagSet {
        self.insert(key, value);
        self
    }

    pub fn insert<V: ToString>(&mut self, key: &str, value: V) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// True iff every (key, value) pair of `filter` is present in `self`.  The empty filter is
    /// contained in every tag set.

    pub fn contains_all(&self, filter: &TagSet) -> bool {
        filter.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> TagSet {
        TagSet(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

/// One named, tagged numeric value.  The value is mutable only through the registry that owns
/// the sample.

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaggedSample {
    pub metric: String,
    pub tags: TagSet,
    pub value: f64,
}

#[test]
fn test_tagset_equality_ignores_insertion_order() {
    let a = TagSet::new().with("uid", "alice").with("gid", "g1");
    let b = TagSet::new().with("gid", "g1").with("uid", "alice");
    assert!(a == b);
    assert!(a != TagSet::new().with("gid", "g1"));
    assert!(a != TagSet::new().with("gid", "g1").with("uid", "bob"));
}

#[test]
fn test_tagset_canonical_values() {
    let a = TagSet::new().with("timestamp", 1705312800i64);
    let b = TagSet::new().with("timestamp", "1705312800");
    assert!(a == b);
}

#[test]
fn test_tagset_contains_all() {
    let t = TagSet::new().with("host", "dccn-c001").with("queue", "batch");
    assert!(t.contains_all(&TagSet::new()));
    assert!(t.contains_all(&TagSet::new().with("host", "dccn-c001")));
    assert!(!t.contains_all(&TagSet::new().with("host", "dccn-c002")));
    assert!(!t.contains_all(&TagSet::new().with("pdu", "pdu1")));
}

#[test]
fn test_tagset_display() {
    let t: TagSet = [("b", "2"), ("a", "1")].into_iter().collect();
    assert!(t.to_string() == "{a=1,b=2}");
}
