//! The in-memory index: a timestamp-sorted row vector plus inverted maps
//! from measurement names, tag key/value pairs, and field keys to row-ids.
//!
//! The index is authoritative only while `valid` is true. In-order inserts
//! keep it current in place; an out-of-order insert merely flips the flag and
//! the next read pays for a full rebuild. Names are interned so the hot maps
//! are dense vectors of row-id sets rather than string-keyed lookups.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::point::Point;

/// A set of row-ids, stored as a sorted vector. Sets are built in insertion
/// order (already ascending) and combined with linear merges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RowSet {
    ids: Vec<usize>,
}

impl RowSet {
    pub(crate) fn new() -> Self {
        RowSet::default()
    }

    pub(crate) fn from_unsorted(mut ids: Vec<usize>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        RowSet { ids }
    }

    fn push(&mut self, id: usize) {
        debug_assert!(self.ids.last().map_or(true, |&last| last < id));
        self.ids.push(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn contains(&self, id: usize) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ids.iter().copied()
    }

    pub(crate) fn union(&self, other: &RowSet) -> RowSet {
        let mut out = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => {
                    out.push(self.ids[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(other.ids[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.ids[i..]);
        out.extend_from_slice(&other.ids[j..]);
        RowSet { ids: out }
    }

    pub(crate) fn intersect(&self, other: &RowSet) -> RowSet {
        let mut out = Vec::with_capacity(self.ids.len().min(other.ids.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        RowSet { ids: out }
    }

    /// Elements of `self` not present in `other`.
    pub(crate) fn difference(&self, other: &RowSet) -> RowSet {
        let mut out = Vec::with_capacity(self.ids.len());
        let mut j = 0;
        for &id in &self.ids {
            while j < other.ids.len() && other.ids[j] < id {
                j += 1;
            }
            if j >= other.ids.len() || other.ids[j] != id {
                out.push(id);
            }
        }
        RowSet { ids: out }
    }
}

/// Maps names to dense ids so the inverted maps can be plain vectors.
#[derive(Debug, Default)]
struct Interner {
    ids: HashMap<String, usize>,
    names: Vec<String>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.names.clear();
    }
}

/// Inverted entry for one tag key: rows carrying the key at all, and rows
/// per concrete value.
#[derive(Debug, Default)]
struct TagKeyEntry {
    rows: RowSet,
    values: HashMap<String, RowSet>,
}

/// The in-memory index over stored rows.
#[derive(Debug)]
pub struct Index {
    /// (timestamp, row-id), sorted by timestamp with ties broken by row-id.
    timestamps: Vec<(DateTime<Utc>, usize)>,
    measurements: Interner,
    by_measurement: Vec<RowSet>,
    tag_keys: Interner,
    by_tag_key: Vec<TagKeyEntry>,
    field_keys: Interner,
    by_field_key: Vec<RowSet>,
    max_time: Option<DateTime<Utc>>,
    num_rows: usize,
    valid: bool,
}

impl Index {
    pub(crate) fn new(valid: bool) -> Self {
        Index {
            timestamps: Vec::new(),
            measurements: Interner::default(),
            by_measurement: Vec::new(),
            tag_keys: Interner::default(),
            by_tag_key: Vec::new(),
            field_keys: Interner::default(),
            by_field_key: Vec::new(),
            max_time: None,
            num_rows: 0,
            valid,
        }
    }

    /// Whether the index faithfully reflects storage.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of indexed rows. Meaningful only while valid.
    pub fn row_count(&self) -> usize {
        self.num_rows
    }

    /// True if no points have been observed.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Incorporates a freshly appended row.
    ///
    /// In-order timestamps are appended in place; a timestamp earlier than
    /// the maximum seen so far (or a missing one) flips `valid` off without
    /// touching anything else. Returns whether the row was indexed.
    pub(crate) fn insert(&mut self, row_id: usize, point: &Point) -> bool {
        if !self.valid {
            return false;
        }
        let time = match point.time {
            Some(t) => t,
            None => {
                self.valid = false;
                return false;
            }
        };
        if let Some(max) = self.max_time {
            if time < max {
                self.valid = false;
                return false;
            }
        }
        self.timestamps.push((time, row_id));
        self.max_time = Some(time);
        self.index_attributes(row_id, point);
        self.num_rows += 1;
        true
    }

    /// Rebuilds from scratch out of a full storage scan. Idempotent.
    pub(crate) fn rebuild<I>(&mut self, points: I)
    where
        I: IntoIterator<Item = (usize, Point)>,
    {
        self.clear();
        let mut all_stamped = true;
        for (row_id, point) in points {
            match point.time {
                Some(time) => {
                    self.timestamps.push((time, row_id));
                    if self.max_time.map_or(true, |max| time > max) {
                        self.max_time = Some(time);
                    }
                }
                None => all_stamped = false,
            }
            self.index_attributes(row_id, &point);
            self.num_rows += 1;
        }
        self.timestamps.sort_by_key(|&(time, row_id)| (time, row_id));
        // An unstamped row cannot be ordered; leave the index invalid and
        // let reads keep scanning storage.
        self.valid = all_stamped;
    }

    /// Empties the index and marks it valid, mirroring a truncated backend.
    pub(crate) fn reset(&mut self) {
        self.clear();
        self.valid = true;
    }

    fn clear(&mut self) {
        self.timestamps.clear();
        self.measurements.clear();
        self.by_measurement.clear();
        self.tag_keys.clear();
        self.by_tag_key.clear();
        self.field_keys.clear();
        self.by_field_key.clear();
        self.max_time = None;
        self.num_rows = 0;
        self.valid = false;
    }

    fn index_attributes(&mut self, row_id: usize, point: &Point) {
        let m_id = self.measurements.intern(&point.measurement);
        if m_id == self.by_measurement.len() {
            self.by_measurement.push(RowSet::new());
        }
        self.by_measurement[m_id].push(row_id);

        for (key, value) in &point.tags {
            let k_id = self.tag_keys.intern(key);
            if k_id == self.by_tag_key.len() {
                self.by_tag_key.push(TagKeyEntry::default());
            }
            let entry = &mut self.by_tag_key[k_id];
            entry.rows.push(row_id);
            entry.values.entry(value.clone()).or_default().push(row_id);
        }

        for key in point.fields.keys() {
            let f_id = self.field_keys.intern(key);
            if f_id == self.by_field_key.len() {
                self.by_field_key.push(RowSet::new());
            }
            self.by_field_key[f_id].push(row_id);
        }
    }

    /// Every indexed row-id.
    pub(crate) fn all_rows(&self) -> RowSet {
        RowSet {
            ids: (0..self.num_rows).collect(),
        }
    }

    /// Rows whose timestamp falls inside the given bounds. Each bound is
    /// `(instant, inclusive)`; `None` leaves that side open. Two binary
    /// searches on the sorted timestamp vector.
    pub(crate) fn rows_in_time_range(
        &self,
        lo: Option<(DateTime<Utc>, bool)>,
        hi: Option<(DateTime<Utc>, bool)>,
    ) -> RowSet {
        let start = match lo {
            None => 0,
            Some((t, true)) => self.timestamps.partition_point(|&(ts, _)| ts < t),
            Some((t, false)) => self.timestamps.partition_point(|&(ts, _)| ts <= t),
        };
        let end = match hi {
            None => self.timestamps.len(),
            Some((t, true)) => self.timestamps.partition_point(|&(ts, _)| ts <= t),
            Some((t, false)) => self.timestamps.partition_point(|&(ts, _)| ts < t),
        };
        if start >= end {
            return RowSet::new();
        }
        RowSet::from_unsorted(self.timestamps[start..end].iter().map(|&(_, id)| id).collect())
    }

    pub(crate) fn rows_for_measurement(&self, name: &str) -> RowSet {
        self.measurements
            .get(name)
            .map(|id| self.by_measurement[id].clone())
            .unwrap_or_default()
    }

    pub(crate) fn rows_for_tag(&self, key: &str, value: &str) -> RowSet {
        self.tag_keys
            .get(key)
            .and_then(|id| self.by_tag_key[id].values.get(value).cloned())
            .unwrap_or_default()
    }

    pub(crate) fn rows_with_tag_key(&self, key: &str) -> RowSet {
        self.tag_keys
            .get(key)
            .map(|id| self.by_tag_key[id].rows.clone())
            .unwrap_or_default()
    }

    pub(crate) fn rows_with_field_key(&self, key: &str) -> RowSet {
        self.field_keys
            .get(key)
            .map(|id| self.by_field_key[id].clone())
            .unwrap_or_default()
    }

    pub(crate) fn measurement_names(&self) -> Vec<String> {
        let mut names = self.measurements.names().to_vec();
        names.sort();
        names
    }

    pub(crate) fn tag_key_names(&self) -> Vec<String> {
        let mut names = self.tag_keys.names().to_vec();
        names.sort();
        names
    }

    pub(crate) fn tag_values(&self, key: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .tag_keys
            .get(key)
            .map(|id| self.by_tag_key[id].values.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    pub(crate) fn field_key_names(&self) -> Vec<String> {
        let mut names = self.field_keys.names().to_vec();
        names.sort();
        names
    }

    /// All indexed timestamps, time-ascending.
    pub(crate) fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.iter().map(|&(t, _)| t).collect()
    }
}
