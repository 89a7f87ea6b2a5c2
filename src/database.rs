//! The engine: orchestrates storage and index, and exposes the public
//! insert/search/update/remove surface.
//!
//! Writes serialize the point and append to the backend without reading
//! anything. Reads consult the index when it is valid: the query tree is
//! partially evaluated into a candidate row-id set plus a residual
//! predicate, and only candidate rows are deserialized. An out-of-order
//! insert invalidates the index; the first read afterwards rebuilds it
//! (unless auto-indexing is off, in which case reads fall back to full
//! scans and stay correct).

use std::collections::BTreeSet;
use std::path::Path as FsPath;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::TinyFluxError;
use crate::index::{Index, RowSet};
use crate::measurement::Measurement;
use crate::point::{utc_now_micros, FieldSet, FieldValue, Point, Row, TagSet};
use crate::query::Query;
use crate::storage::{CsvStorage, MemoryStorage, Storage};
use crate::telemetry::{noop_event_listener, DbEvent, EventListener, InvalidationReason};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Rebuild the index lazily on the first read after invalidation. When
    /// off, reads never rebuild and always scan storage.
    pub auto_index: bool,
    /// Default key-prefix convention for serialized rows: compact `t_`/`f_`
    /// instead of the full `__tag__`/`__field__`.
    pub compact_keys: bool,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn EventListener>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            auto_index: true,
            compact_keys: false,
            event_listener: noop_event_listener(),
        }
    }
}

/// One selected attribute value, as returned by [`TinyFlux::select`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Time(DateTime<Utc>),
    Str(String),
    Field(FieldValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectPath {
    Time,
    Measurement,
    Tag(String),
    Field(String),
}

fn parse_select_path(raw: &str) -> Result<SelectPath, TinyFluxError> {
    match raw {
        "time" => Ok(SelectPath::Time),
        "measurement" => Ok(SelectPath::Measurement),
        _ => {
            if let Some(key) = raw.strip_prefix("tags.") {
                Ok(SelectPath::Tag(key.to_string()))
            } else if let Some(key) = raw.strip_prefix("fields.") {
                Ok(SelectPath::Field(key.to_string()))
            } else {
                Err(TinyFluxError::UnknownSelectPath(raw.to_string()))
            }
        }
    }
}

fn extract(point: &Point, path: &SelectPath) -> Option<AttrValue> {
    match path {
        SelectPath::Time => point.time.map(AttrValue::Time),
        SelectPath::Measurement => Some(AttrValue::Str(point.measurement.clone())),
        SelectPath::Tag(key) => point.tags.get(key).map(|v| AttrValue::Str(v.clone())),
        SelectPath::Field(key) => point.fields.get(key).map(|v| AttrValue::Field(v.clone())),
    }
}

#[derive(Clone)]
enum TimeUpdate {
    Set(DateTime<Utc>),
    Map(Rc<dyn Fn(DateTime<Utc>) -> DateTime<Utc>>),
}

#[derive(Clone)]
enum MeasurementUpdate {
    Set(String),
    Map(Rc<dyn Fn(&str) -> String>),
}

#[derive(Clone)]
enum TagsUpdate {
    Merge(TagSet),
    Map(Rc<dyn Fn(&TagSet) -> TagSet>),
}

#[derive(Clone)]
enum FieldsUpdate {
    Merge(FieldSet),
    Map(Rc<dyn Fn(&FieldSet) -> FieldSet>),
}

/// Per-attribute update specification for [`TinyFlux::update`].
///
/// Tag and field updates have merge semantics: keys present in the supplied
/// (or returned) map overwrite, keys omitted are retained. `unset_tags` /
/// `unset_fields` remove named keys after the merge.
///
/// ```
/// use tinyflux::Update;
///
/// let u = Update::new()
///     .map_tags(|tags| {
///         let mut t = tags.clone();
///         t.insert("state".to_string(), "CA".to_string());
///         t
///     })
///     .unset_tags(["room"]);
/// ```
#[derive(Clone, Default)]
pub struct Update {
    time: Option<TimeUpdate>,
    measurement: Option<MeasurementUpdate>,
    tags: Option<TagsUpdate>,
    fields: Option<FieldsUpdate>,
    unset_tags: Vec<String>,
    unset_fields: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Update::default()
    }

    /// Replaces the timestamp, normalized to UTC.
    pub fn time<Tz: TimeZone>(mut self, time: DateTime<Tz>) -> Self {
        self.time = Some(TimeUpdate::Set(time.with_timezone(&Utc)));
        self
    }

    /// Transforms the timestamp. Unstamped points are left untouched.
    pub fn map_time(mut self, f: impl Fn(DateTime<Utc>) -> DateTime<Utc> + 'static) -> Self {
        self.time = Some(TimeUpdate::Map(Rc::new(f)));
        self
    }

    pub fn measurement(mut self, name: impl Into<String>) -> Self {
        self.measurement = Some(MeasurementUpdate::Set(name.into()));
        self
    }

    pub fn map_measurement(mut self, f: impl Fn(&str) -> String + 'static) -> Self {
        self.measurement = Some(MeasurementUpdate::Map(Rc::new(f)));
        self
    }

    /// Merges the given tags into each matching point.
    pub fn tags(mut self, tags: TagSet) -> Self {
        self.tags = Some(TagsUpdate::Merge(tags));
        self
    }

    /// Merges the map returned by `f` (receiving the current tag set) into
    /// each matching point.
    pub fn map_tags(mut self, f: impl Fn(&TagSet) -> TagSet + 'static) -> Self {
        self.tags = Some(TagsUpdate::Map(Rc::new(f)));
        self
    }

    pub fn fields(mut self, fields: FieldSet) -> Self {
        self.fields = Some(FieldsUpdate::Merge(fields));
        self
    }

    pub fn map_fields(mut self, f: impl Fn(&FieldSet) -> FieldSet + 'static) -> Self {
        self.fields = Some(FieldsUpdate::Map(Rc::new(f)));
        self
    }

    /// Removes the named tag keys after the merge.
    pub fn unset_tags<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.unset_tags.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Removes the named field keys after the merge.
    pub fn unset_fields<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.unset_fields.extend(keys.into_iter().map(Into::into));
        self
    }

    fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.measurement.is_none()
            && self.tags.is_none()
            && self.fields.is_none()
            && self.unset_tags.is_empty()
            && self.unset_fields.is_empty()
    }

    fn apply(&self, point: &Point) -> Point {
        let mut updated = point.clone();

        match &self.time {
            Some(TimeUpdate::Set(t)) => updated.time = Some(*t),
            Some(TimeUpdate::Map(f)) => {
                if let Some(t) = updated.time {
                    updated.time = Some(f(t));
                }
            }
            None => {}
        }

        match &self.measurement {
            Some(MeasurementUpdate::Set(name)) => updated.measurement = name.clone(),
            Some(MeasurementUpdate::Map(f)) => {
                updated.measurement = f(&updated.measurement);
            }
            None => {}
        }

        match &self.tags {
            Some(TagsUpdate::Merge(tags)) => updated.tags.extend(tags.clone()),
            Some(TagsUpdate::Map(f)) => {
                let merged = f(&updated.tags);
                updated.tags.extend(merged);
            }
            None => {}
        }
        for key in &self.unset_tags {
            updated.tags.remove(key);
        }

        match &self.fields {
            Some(FieldsUpdate::Merge(fields)) => updated.fields.extend(fields.clone()),
            Some(FieldsUpdate::Map(f)) => {
                let merged = f(&updated.fields);
                updated.fields.extend(merged);
            }
            None => {}
        }
        for key in &self.unset_fields {
            updated.fields.remove(key);
        }

        updated
    }
}

/// How a read will visit storage.
enum Plan {
    /// Full scan, filtering every row through the query.
    Scan,
    /// Index-restricted scan: only candidate rows are deserialized, and
    /// filtered through the residual (if any).
    Candidates {
        rows: RowSet,
        residual: Option<Query>,
    },
}

/// The embedded time-series datastore.
///
/// Single-threaded cooperative: every call runs to completion before the
/// next; the engine exclusively owns its backend and index.
#[derive(Debug)]
pub struct TinyFlux<S: Storage> {
    storage: S,
    index: Index,
    config: Config,
}

impl TinyFlux<CsvStorage> {
    /// Opens a datastore backed by the CSV file at `path` (created along
    /// with missing parent directories).
    pub fn open(path: impl AsRef<FsPath>) -> Result<Self, TinyFluxError> {
        Self::with_config(CsvStorage::open(path)?, Config::default())
    }
}

impl TinyFlux<MemoryStorage> {
    /// Opens an in-memory datastore.
    pub fn memory() -> Self {
        TinyFlux {
            storage: MemoryStorage::new(),
            index: Index::new(true),
            config: Config::default(),
        }
    }
}

impl<S: Storage> TinyFlux<S> {
    pub fn with_storage(storage: S) -> Result<Self, TinyFluxError> {
        Self::with_config(storage, Config::default())
    }

    /// The index starts valid only for an empty backend; opening existing
    /// data leaves it invalid until the first read rebuilds it.
    pub fn with_config(mut storage: S, config: Config) -> Result<Self, TinyFluxError> {
        let initially_empty = storage.len()? == 0;
        Ok(TinyFlux {
            storage,
            index: Index::new(initially_empty),
            config,
        })
    }

    /// Read-only view of the index, mainly for inspection in tests and
    /// tooling.
    pub fn index(&self) -> &Index {
        &self.index
    }

    fn emit(&self, event: DbEvent) {
        self.config.event_listener.on_event(event);
    }

    /// Rebuilds the index if auto-indexing is on and it is invalid. A failed
    /// rebuild propagates and leaves the index invalid.
    fn ensure_index(&mut self) -> Result<(), TinyFluxError> {
        if !self.config.auto_index || self.index.is_valid() {
            return Ok(());
        }
        self.reindex()
    }

    /// Forces a full index rebuild from a storage scan.
    pub fn reindex(&mut self) -> Result<(), TinyFluxError> {
        let points = self.load_all()?;
        let rows = points.len();
        self.index.rebuild(points);
        self.emit(DbEvent::IndexRebuilt { rows });
        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<(usize, Point)>, TinyFluxError> {
        let mut out = Vec::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            out.push((id, Point::from_row(id, &row)?));
        }
        Ok(out)
    }

    fn plan(&mut self, query: &Query) -> Result<Plan, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            let (rows, residual) = query.partial_eval(&self.index);
            Ok(Plan::Candidates { rows, residual })
        } else {
            Ok(Plan::Scan)
        }
    }

    /// Inserts a point using the configured key-prefix convention,
    /// returning its row-id. Constant-time append; storage is never read.
    pub fn insert(&mut self, point: Point) -> Result<usize, TinyFluxError> {
        let compact = self.config.compact_keys;
        self.insert_with(point, compact)
    }

    /// Inserts a point, choosing the key-prefix convention for this row.
    /// An unstamped point is stamped with the current UTC time.
    pub fn insert_with(
        &mut self,
        mut point: Point,
        compact_keys: bool,
    ) -> Result<usize, TinyFluxError> {
        if point.time.is_none() {
            point.time = Some(utc_now_micros());
        }
        let row = point.to_row(compact_keys);
        let id = self.storage.append(row)?;
        self.emit(DbEvent::PointsAppended { count: 1 });
        if self.config.auto_index && self.index.is_valid() && !self.index.insert(id, &point) {
            self.emit(DbEvent::IndexInvalidated {
                reason: InvalidationReason::OutOfOrderInsert,
            });
        }
        Ok(id)
    }

    /// Inserts points in iteration order, appending in batches of
    /// `batch_size`. All unstamped points in the call share one timestamp.
    pub fn insert_multiple<I>(&mut self, points: I, batch_size: usize) -> Result<usize, TinyFluxError>
    where
        I: IntoIterator<Item = Point>,
    {
        if batch_size < 1 {
            return Err(TinyFluxError::InvalidBatchSize(batch_size));
        }
        let now = utc_now_micros();
        let compact = self.config.compact_keys;
        let mut iter = points.into_iter();
        let mut total = 0;
        loop {
            let batch: Vec<Point> = iter
                .by_ref()
                .take(batch_size)
                .map(|mut p| {
                    if p.time.is_none() {
                        p.time = Some(now);
                    }
                    p
                })
                .collect();
            if batch.is_empty() {
                break;
            }
            let rows: Vec<Row> = batch.iter().map(|p| p.to_row(compact)).collect();
            let ids = self.storage.append_many(rows)?;
            self.emit(DbEvent::PointsAppended { count: ids.len() });
            if self.config.auto_index && self.index.is_valid() {
                for (id, point) in ids.iter().zip(batch.iter()) {
                    if !self.index.insert(*id, point) {
                        self.emit(DbEvent::IndexInvalidated {
                            reason: InvalidationReason::OutOfOrderInsert,
                        });
                        break;
                    }
                }
            }
            total += batch.len();
        }
        Ok(total)
    }

    /// All points matching the query, sorted by time ascending (ties in
    /// insertion order).
    pub fn search(&mut self, query: &Query) -> Result<Vec<Point>, TinyFluxError> {
        self.search_with(query, true)
    }

    /// As [`Self::search`]; `sorted = false` keeps insertion order.
    pub fn search_with(
        &mut self,
        query: &Query,
        sorted: bool,
    ) -> Result<Vec<Point>, TinyFluxError> {
        let plan = self.plan(query)?;
        let mut found = Vec::new();
        match plan {
            Plan::Candidates { rows, residual } => {
                if rows.is_empty() {
                    return Ok(found);
                }
                let mut seen = 0;
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    if !rows.contains(id) {
                        continue;
                    }
                    let point = Point::from_row(id, &row)?;
                    match &residual {
                        None => found.push(point),
                        Some(r) => {
                            if r.matches(&point) {
                                found.push(point);
                            }
                        }
                    }
                    seen += 1;
                    if seen == rows.len() {
                        break;
                    }
                }
            }
            Plan::Scan => {
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    let point = Point::from_row(id, &row)?;
                    if query.matches(&point) {
                        found.push(point);
                    }
                }
            }
        }
        if sorted {
            found.sort_by_key(|p| p.time);
        }
        Ok(found)
    }

    /// Number of points matching the query. Skips materialization entirely
    /// when the index answers the query exactly.
    pub fn count(&mut self, query: &Query) -> Result<usize, TinyFluxError> {
        match self.plan(query)? {
            Plan::Candidates {
                rows,
                residual: None,
            } => Ok(rows.len()),
            Plan::Candidates {
                rows,
                residual: Some(residual),
            } => {
                if rows.is_empty() {
                    return Ok(0);
                }
                let mut count = 0;
                let mut seen = 0;
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    if !rows.contains(id) {
                        continue;
                    }
                    if residual.matches(&Point::from_row(id, &row)?) {
                        count += 1;
                    }
                    seen += 1;
                    if seen == rows.len() {
                        break;
                    }
                }
                Ok(count)
            }
            Plan::Scan => {
                let mut count = 0;
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    if query.matches(&Point::from_row(id, &row)?) {
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    /// Whether any point matches the query; stops at the first match.
    pub fn contains(&mut self, query: &Query) -> Result<bool, TinyFluxError> {
        match self.plan(query)? {
            Plan::Candidates {
                rows,
                residual: None,
            } => Ok(!rows.is_empty()),
            Plan::Candidates {
                rows,
                residual: Some(residual),
            } => {
                if rows.is_empty() {
                    return Ok(false);
                }
                let mut seen = 0;
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    if !rows.contains(id) {
                        continue;
                    }
                    if residual.matches(&Point::from_row(id, &row)?) {
                        return Ok(true);
                    }
                    seen += 1;
                    if seen == rows.len() {
                        break;
                    }
                }
                Ok(false)
            }
            Plan::Scan => {
                for item in self.storage.read_all()? {
                    let (id, row) = item?;
                    if query.matches(&Point::from_row(id, &row)?) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// First matching point in time order, ties broken by insertion order;
    /// `None` when nothing matches.
    pub fn get(&mut self, query: &Query) -> Result<Option<Point>, TinyFluxError> {
        Ok(self.search(query)?.into_iter().next())
    }

    /// Tuples of the requested attribute paths (`"time"`, `"measurement"`,
    /// `"tags.<key>"`, `"fields.<key>"`) for every matching point. A missing
    /// tag or field key yields `None` in that position.
    pub fn select(
        &mut self,
        paths: &[&str],
        query: &Query,
    ) -> Result<Vec<Vec<Option<AttrValue>>>, TinyFluxError> {
        let parsed: Vec<SelectPath> = paths
            .iter()
            .map(|raw| parse_select_path(raw))
            .collect::<Result<_, _>>()?;
        let points = self.search(query)?;
        Ok(points
            .iter()
            .map(|p| parsed.iter().map(|path| extract(p, path)).collect())
            .collect())
    }

    /// Every point, sorted by time ascending.
    pub fn all(&mut self) -> Result<Vec<Point>, TinyFluxError> {
        self.all_with(true)
    }

    /// Every point; `sorted = false` keeps insertion order.
    pub fn all_with(&mut self, sorted: bool) -> Result<Vec<Point>, TinyFluxError> {
        self.ensure_index()?;
        let mut points: Vec<Point> = self.load_all()?.into_iter().map(|(_, p)| p).collect();
        if sorted {
            points.sort_by_key(|p| p.time);
        }
        Ok(points)
    }

    /// Streams every point in insertion order.
    pub fn iter(
        &mut self,
    ) -> Result<impl Iterator<Item = Result<Point, TinyFluxError>> + '_, TinyFluxError> {
        self.ensure_index()?;
        let rows = self.storage.read_all()?;
        Ok(rows.map(|item| item.and_then(|(id, row)| Point::from_row(id, &row))))
    }

    /// Number of stored points.
    pub fn len(&mut self) -> Result<usize, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            Ok(self.index.row_count())
        } else {
            self.storage.len()
        }
    }

    pub fn is_empty(&mut self) -> Result<bool, TinyFluxError> {
        Ok(self.len()? == 0)
    }

    /// Names of all measurements, sorted.
    pub fn get_measurements(&mut self) -> Result<Vec<String>, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            return Ok(self.index.measurement_names());
        }
        let mut names = BTreeSet::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let point = Point::from_row(id, &row)?;
            names.insert(point.measurement);
        }
        Ok(names.into_iter().collect())
    }

    /// All tag keys, sorted.
    pub fn get_tag_keys(&mut self) -> Result<Vec<String>, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            return Ok(self.index.tag_key_names());
        }
        let mut keys = BTreeSet::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let point = Point::from_row(id, &row)?;
            keys.extend(point.tags.into_keys());
        }
        Ok(keys.into_iter().collect())
    }

    /// Distinct values of one tag key, sorted.
    pub fn get_tag_values(&mut self, key: &str) -> Result<Vec<String>, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            return Ok(self.index.tag_values(key));
        }
        let mut values = BTreeSet::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let mut point = Point::from_row(id, &row)?;
            if let Some(value) = point.tags.remove(key) {
                values.insert(value);
            }
        }
        Ok(values.into_iter().collect())
    }

    /// All field keys, sorted.
    pub fn get_field_keys(&mut self) -> Result<Vec<String>, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            return Ok(self.index.field_key_names());
        }
        let mut keys = BTreeSet::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let point = Point::from_row(id, &row)?;
            keys.extend(point.fields.into_keys());
        }
        Ok(keys.into_iter().collect())
    }

    /// Values of one field key in insertion order. Field values are indexed
    /// by key only, so this always scans storage.
    pub fn get_field_values(&mut self, key: &str) -> Result<Vec<FieldValue>, TinyFluxError> {
        self.ensure_index()?;
        let mut values = Vec::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let mut point = Point::from_row(id, &row)?;
            if let Some(value) = point.fields.remove(key) {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// All timestamps, time-ascending.
    pub fn get_timestamps(&mut self) -> Result<Vec<DateTime<Utc>>, TinyFluxError> {
        self.ensure_index()?;
        if self.config.auto_index && self.index.is_valid() {
            return Ok(self.index.timestamps());
        }
        let mut times = Vec::new();
        for item in self.storage.read_all()? {
            let (id, row) = item?;
            let point = Point::from_row(id, &row)?;
            if let Some(t) = point.time {
                times.push(t);
            }
        }
        times.sort();
        Ok(times)
    }

    /// Rewrites matching points with the given update, returning how many
    /// actually changed. Always forces a rebuild afterwards.
    pub fn update(&mut self, query: &Query, update: &Update) -> Result<usize, TinyFluxError> {
        self.apply_rewrite(Some(query), Some(update))
    }

    /// As [`Self::update`], without a predicate.
    pub fn update_all(&mut self, update: &Update) -> Result<usize, TinyFluxError> {
        self.apply_rewrite(None, Some(update))
    }

    /// Drops matching points, returning how many were removed.
    pub fn remove(&mut self, query: &Query) -> Result<usize, TinyFluxError> {
        self.apply_rewrite(Some(query), None)
    }

    /// Drops every point belonging to the measurement, returning the count.
    pub fn drop_measurement(&mut self, name: &str) -> Result<usize, TinyFluxError> {
        use crate::query::MeasurementQuery;
        self.remove(&MeasurementQuery::new().eq(name))
    }

    /// Removes every point and resets the index to valid-empty.
    pub fn remove_all(&mut self) -> Result<(), TinyFluxError> {
        self.storage.rewrite(Vec::new())?;
        self.emit(DbEvent::StorageRewritten { rows: 0 });
        self.index.reset();
        Ok(())
    }

    /// Shared scan-and-rewrite path for update and remove. Streams storage
    /// into a fresh row vector, swaps backends atomically, then rebuilds
    /// (or leaves the index invalid when auto-indexing is off).
    fn apply_rewrite(
        &mut self,
        query: Option<&Query>,
        update: Option<&Update>,
    ) -> Result<usize, TinyFluxError> {
        if let Some(u) = update {
            if u.is_empty() {
                return Err(TinyFluxError::EmptyUpdate);
            }
        }

        let plan = match query {
            Some(q) => Some(self.plan(q)?),
            None => None,
        };

        let compact = self.config.compact_keys;
        let mut new_rows: Vec<Row> = Vec::new();
        let mut affected = 0;

        for item in self.storage.read_all()? {
            let (id, row) = item?;

            let candidate = match &plan {
                Some(Plan::Candidates { rows, .. }) => rows.contains(id),
                _ => true,
            };
            if !candidate {
                new_rows.push(row);
                continue;
            }

            let point = Point::from_row(id, &row)?;
            let matched = match &plan {
                None => true,
                Some(Plan::Candidates { residual: None, .. }) => true,
                Some(Plan::Candidates {
                    residual: Some(r), ..
                }) => r.matches(&point),
                Some(Plan::Scan) => match query {
                    Some(q) => q.matches(&point),
                    None => true,
                },
            };
            if !matched {
                new_rows.push(row);
                continue;
            }

            match update {
                Some(u) => {
                    let updated = u.apply(&point);
                    if updated != point {
                        affected += 1;
                        new_rows.push(updated.to_row(compact));
                    } else {
                        new_rows.push(row);
                    }
                }
                None => {
                    affected += 1;
                }
            }
        }

        let total = new_rows.len();
        self.storage.rewrite(new_rows)?;
        self.emit(DbEvent::StorageRewritten { rows: total });
        self.index.invalidate();
        self.emit(DbEvent::IndexInvalidated {
            reason: InvalidationReason::BulkRewrite,
        });
        if self.config.auto_index {
            self.reindex()?;
        }
        Ok(affected)
    }

    /// A scoped view over one measurement.
    pub fn measurement(&mut self, name: impl Into<String>) -> Measurement<'_, S> {
        Measurement::new(name.into(), self)
    }

    /// Flushes and releases backend resources.
    pub fn close(&mut self) -> Result<(), TinyFluxError> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FieldQuery, MeasurementQuery, TagQuery, TimeQuery};
    use chrono::TimeZone;

    fn t(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, secs).unwrap()
    }

    fn db_with_points() -> TinyFlux<MemoryStorage> {
        let mut db = TinyFlux::memory();
        db.insert(
            Point::new()
                .with_time(t(0))
                .with_tag("city", "LA")
                .with_field("aqi", 112),
        )
        .unwrap();
        db.insert(
            Point::new()
                .with_time(t(10))
                .with_tag("city", "SF")
                .with_field("aqi", 128),
        )
        .unwrap();
        db
    }

    #[test]
    fn insert_stamps_unstamped_points() {
        let mut db = TinyFlux::memory();
        let before = Utc::now();
        db.insert(Point::new().with_field("x", 1)).unwrap();
        let after = Utc::now();
        let points = db.all().unwrap();
        let stamped = points[0].time.unwrap();
        assert!(stamped >= before - chrono::Duration::microseconds(1));
        assert!(stamped <= after);
    }

    #[test]
    fn search_uses_residual_for_field_comparisons() {
        let mut db = db_with_points();
        let hits = db.search(&FieldQuery::new().key("aqi").gt(120)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tags["city"], "SF");
    }

    #[test]
    fn count_without_residual_skips_materialization() {
        let mut db = db_with_points();
        assert_eq!(db.count(&TimeQuery::new().gte(t(5))).unwrap(), 1);
        assert_eq!(db.count(&TagQuery::new().key("city").eq("LA")).unwrap(), 1);
    }

    #[test]
    fn contains_matches_count() {
        let mut db = db_with_points();
        for q in [
            TagQuery::new().key("city").eq("LA"),
            TagQuery::new().key("city").eq("Oakland"),
            FieldQuery::new().key("aqi").gt(200),
            MeasurementQuery::new().eq("_default"),
        ] {
            assert_eq!(db.contains(&q).unwrap(), db.count(&q).unwrap() > 0);
        }
    }

    #[test]
    fn select_paths_and_unknown_path_error() {
        let mut db = db_with_points();
        let rows = db
            .select(&["time", "tags.city", "fields.aqi"], &Query::noop())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Some(AttrValue::Str("LA".to_string())));
        assert_eq!(rows[1][2], Some(AttrValue::Field(FieldValue::Integer(128))));

        let err = db.select(&["bogus"], &Query::noop()).unwrap_err();
        assert!(matches!(err, TinyFluxError::UnknownSelectPath(_)));
    }

    #[test]
    fn batch_size_zero_is_rejected() {
        let mut db = TinyFlux::memory();
        let err = db.insert_multiple(vec![Point::new()], 0).unwrap_err();
        assert!(matches!(err, TinyFluxError::InvalidBatchSize(0)));
        assert_eq!(db.len().unwrap(), 0);
    }

    #[test]
    fn empty_update_is_rejected() {
        let mut db = db_with_points();
        let err = db.update_all(&Update::new()).unwrap_err();
        assert!(matches!(err, TinyFluxError::EmptyUpdate));
    }

    #[test]
    fn update_merges_tags_and_unset_removes() {
        let mut db = db_with_points();
        let changed = db
            .update_all(&Update::new().tags(TagSet::from([(
                "state".to_string(),
                "CA".to_string(),
            )])))
            .unwrap();
        assert_eq!(changed, 2);
        for p in db.all().unwrap() {
            assert_eq!(p.tags["state"], "CA");
            assert!(p.tags.contains_key("city"));
        }

        db.update_all(&Update::new().unset_tags(["city"])).unwrap();
        for p in db.all().unwrap() {
            assert!(!p.tags.contains_key("city"));
            assert_eq!(p.tags["state"], "CA");
        }
    }

    #[test]
    fn update_counts_only_changed_points() {
        let mut db = db_with_points();
        let changed = db
            .update(
                &TagQuery::new().key("city").eq("LA"),
                &Update::new().fields(FieldSet::from([(
                    "aqi".to_string(),
                    FieldValue::Integer(112),
                )])),
            )
            .unwrap();
        // The LA point already carries aqi=112.
        assert_eq!(changed, 0);
        assert!(db.index().is_valid());
    }

    #[test]
    fn remove_drops_matching_rows_and_reindexes() {
        let mut db = db_with_points();
        let removed = db.remove(&TagQuery::new().key("city").eq("LA")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.len().unwrap(), 1);
        assert!(db.index().is_valid());
        assert_eq!(db.all().unwrap()[0].tags["city"], "SF");
    }

    #[test]
    fn remove_all_resets_to_valid_empty() {
        let mut db = db_with_points();
        db.remove_all().unwrap();
        assert_eq!(db.len().unwrap(), 0);
        assert!(db.index().is_valid());
        assert!(db.all().unwrap().is_empty());
    }

    #[test]
    fn empty_db_reads_do_not_invalidate() {
        let mut db = TinyFlux::memory();
        assert!(db.search(&Query::noop()).unwrap().is_empty());
        assert!(!db.contains(&TagQuery::new().key("a").exists()).unwrap());
        assert_eq!(db.count(&Query::noop()).unwrap(), 0);
        assert!(db.index().is_valid());
    }

    #[test]
    fn auto_index_off_scans_without_rebuilding() {
        let mut db = TinyFlux::with_config(
            MemoryStorage::new(),
            Config {
                auto_index: false,
                ..Config::default()
            },
        )
        .unwrap();
        db.insert(Point::new().with_time(t(10)).with_field("x", 1))
            .unwrap();
        db.insert(Point::new().with_time(t(5)).with_field("x", 2))
            .unwrap();
        let hits = db.search(&FieldQuery::new().key("x").exists()).unwrap();
        assert_eq!(hits.len(), 2);
        // Reads never rebuilt anything.
        assert_eq!(db.index().row_count(), 0);
    }

    #[test]
    fn get_summaries_from_index_and_fallback() {
        let mut db = db_with_points();
        assert_eq!(db.get_measurements().unwrap(), vec!["_default"]);
        assert_eq!(db.get_tag_keys().unwrap(), vec!["city"]);
        assert_eq!(db.get_tag_values("city").unwrap(), vec!["LA", "SF"]);
        assert_eq!(db.get_field_keys().unwrap(), vec!["aqi"]);
        assert_eq!(
            db.get_field_values("aqi").unwrap(),
            vec![FieldValue::Integer(112), FieldValue::Integer(128)]
        );
        assert_eq!(db.get_timestamps().unwrap(), vec![t(0), t(10)]);
    }

    #[test]
    fn sorted_search_breaks_ties_by_insertion_order() {
        let mut db = TinyFlux::memory();
        db.insert(Point::new().with_time(t(1)).with_field("n", 1))
            .unwrap();
        db.insert(Point::new().with_time(t(1)).with_field("n", 2))
            .unwrap();
        db.insert(Point::new().with_time(t(0)).with_field("n", 3))
            .unwrap();
        let hits = db.search(&FieldQuery::new().key("n").exists()).unwrap();
        let ns: Vec<_> = hits.iter().map(|p| p.fields["n"].clone()).collect();
        assert_eq!(
            ns,
            vec![
                FieldValue::Integer(3),
                FieldValue::Integer(1),
                FieldValue::Integer(2)
            ]
        );
        let first = db.get(&FieldQuery::new().key("n").exists()).unwrap().unwrap();
        assert_eq!(first.fields["n"], FieldValue::Integer(3));
    }
}
