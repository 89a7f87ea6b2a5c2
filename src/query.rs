//! The query algebra: predicate leaves over point attributes, boolean
//! combinators, and partial evaluation against the index.
//!
//! A query is a tree. Leaves test a single attribute path (time, measurement,
//! one tag value, one field value); `Not`/`And`/`Or` combine subtrees.
//! Evaluation against a point is three-valued: a leaf whose attribute is
//! missing yields "undefined" rather than false, so that negation only
//! succeeds when the inner test unambiguously failed. A query matches a point
//! iff the final result is definitely true.
//!
//! Against a valid index, [`Query::partial_eval`] splits the tree into an
//! exact candidate row-id set and a residual predicate; the engine then
//! deserializes candidate rows only and filters them through the residual.

use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::TinyFluxError;
use crate::index::{Index, RowSet};
use crate::point::{FieldValue, Point};

/// Comparison operator of a simple leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }
}

/// Attribute path a leaf navigates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Path {
    Time,
    Measurement,
    Tag(String),
    Field(String),
}

pub(crate) type TimeMapFn = Rc<dyn Fn(DateTime<Utc>) -> DateTime<Utc>>;
pub(crate) type TimeTestFn = Rc<dyn Fn(DateTime<Utc>) -> bool>;
pub(crate) type StrMapFn = Rc<dyn Fn(&str) -> String>;
pub(crate) type StrTestFn = Rc<dyn Fn(&str) -> bool>;
pub(crate) type FieldMapFn = Rc<dyn Fn(&FieldValue) -> FieldValue>;
pub(crate) type FieldTestFn = Rc<dyn Fn(&FieldValue) -> bool>;

/// The test a leaf applies to its resolved attribute value.
///
/// Map and test functions are opaque caller-supplied values. They must be
/// pure: the engine may evaluate them zero times (row excluded by the index)
/// or several times for the same point.
#[derive(Clone)]
pub(crate) enum LeafTest {
    TimeCmp(CmpOp, DateTime<Utc>),
    TimeMap(TimeMapFn, CmpOp, DateTime<Utc>),
    TimeTest(TimeTestFn),
    StrCmp(CmpOp, String),
    StrRegex(Regex),
    StrMap(StrMapFn, CmpOp, String),
    StrTest(StrTestFn),
    FieldCmp(CmpOp, FieldValue),
    FieldMap(FieldMapFn, CmpOp, FieldValue),
    FieldTest(FieldTestFn),
    Exists,
}

impl fmt::Debug for LeafTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafTest::TimeCmp(op, rhs) => write!(f, "TimeCmp({:?}, {})", op, rhs),
            LeafTest::TimeMap(_, op, rhs) => write!(f, "TimeMap(<fn>, {:?}, {})", op, rhs),
            LeafTest::TimeTest(_) => write!(f, "TimeTest(<fn>)"),
            LeafTest::StrCmp(op, rhs) => write!(f, "StrCmp({:?}, {:?})", op, rhs),
            LeafTest::StrRegex(re) => write!(f, "StrRegex({:?})", re.as_str()),
            LeafTest::StrMap(_, op, rhs) => write!(f, "StrMap(<fn>, {:?}, {:?})", op, rhs),
            LeafTest::StrTest(_) => write!(f, "StrTest(<fn>)"),
            LeafTest::FieldCmp(op, rhs) => write!(f, "FieldCmp({:?}, {:?})", op, rhs),
            LeafTest::FieldMap(_, op, rhs) => write!(f, "FieldMap(<fn>, {:?}, {:?})", op, rhs),
            LeafTest::FieldTest(_) => write!(f, "FieldTest(<fn>)"),
            LeafTest::Exists => write!(f, "Exists"),
        }
    }
}

/// A single predicate over one attribute path.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub(crate) path: Path,
    pub(crate) test: LeafTest,
}

/// Attribute value a path resolved to on a concrete point.
enum Resolved<'a> {
    Time(DateTime<Utc>),
    Str(&'a str),
    Field(&'a FieldValue),
}

impl Leaf {
    fn resolve<'a>(&self, point: &'a Point) -> Option<Resolved<'a>> {
        match &self.path {
            Path::Time => point.time.map(Resolved::Time),
            Path::Measurement => Some(Resolved::Str(&point.measurement)),
            Path::Tag(key) => point.tags.get(key).map(|v| Resolved::Str(v)),
            Path::Field(key) => point.fields.get(key).map(Resolved::Field),
        }
    }

    /// Three-valued evaluation: `None` when the attribute is missing or the
    /// comparison is undefined for the value kinds involved. Existence is
    /// total: a missing key is definitely false, so its negation matches.
    fn eval(&self, point: &Point) -> Option<bool> {
        if let LeafTest::Exists = self.test {
            return Some(self.resolve(point).is_some());
        }
        let value = self.resolve(point)?;
        match (&self.test, value) {
            (LeafTest::TimeCmp(op, rhs), Resolved::Time(t)) => Some(op.apply(t.cmp(rhs))),
            (LeafTest::TimeMap(f, op, rhs), Resolved::Time(t)) => Some(op.apply(f(t).cmp(rhs))),
            (LeafTest::TimeTest(f), Resolved::Time(t)) => Some(f(t)),
            (LeafTest::StrCmp(op, rhs), Resolved::Str(s)) => Some(op.apply(s.cmp(rhs.as_str()))),
            (LeafTest::StrRegex(re), Resolved::Str(s)) => Some(re.is_match(s)),
            (LeafTest::StrMap(f, op, rhs), Resolved::Str(s)) => {
                Some(op.apply(f(s).as_str().cmp(rhs.as_str())))
            }
            (LeafTest::StrTest(f), Resolved::Str(s)) => Some(f(s)),
            (LeafTest::FieldCmp(op, rhs), Resolved::Field(v)) => {
                v.partial_cmp_value(rhs).map(|ord| op.apply(ord))
            }
            (LeafTest::FieldMap(f, op, rhs), Resolved::Field(v)) => {
                f(v).partial_cmp_value(rhs).map(|ord| op.apply(ord))
            }
            (LeafTest::FieldTest(f), Resolved::Field(v)) => Some(f(v)),
            // Path/test kind mismatch cannot be built through the public
            // constructors; treat it as undefined rather than panic.
            _ => None,
        }
    }

    /// Index fast path: the exact row-id set matching this leaf, or `None`
    /// when the leaf cannot be answered from the index alone.
    fn index_rows(&self, index: &Index) -> Option<RowSet> {
        match (&self.path, &self.test) {
            (Path::Time, LeafTest::TimeCmp(op, rhs)) => Some(match op {
                CmpOp::Eq => index.rows_in_time_range(Some((*rhs, true)), Some((*rhs, true))),
                CmpOp::Ne => {
                    let eq = index.rows_in_time_range(Some((*rhs, true)), Some((*rhs, true)));
                    index.all_rows().difference(&eq)
                }
                CmpOp::Lt => index.rows_in_time_range(None, Some((*rhs, false))),
                CmpOp::Le => index.rows_in_time_range(None, Some((*rhs, true))),
                CmpOp::Gt => index.rows_in_time_range(Some((*rhs, false)), None),
                CmpOp::Ge => index.rows_in_time_range(Some((*rhs, true)), None),
            }),
            (Path::Measurement, LeafTest::StrCmp(CmpOp::Eq, rhs)) => {
                Some(index.rows_for_measurement(rhs))
            }
            (Path::Measurement, LeafTest::StrCmp(CmpOp::Ne, rhs)) => {
                Some(index.all_rows().difference(&index.rows_for_measurement(rhs)))
            }
            (Path::Tag(key), LeafTest::StrCmp(CmpOp::Eq, rhs)) => {
                Some(index.rows_for_tag(key, rhs))
            }
            (Path::Tag(key), LeafTest::Exists) => Some(index.rows_with_tag_key(key)),
            (Path::Field(key), LeafTest::Exists) => Some(index.rows_with_field_key(key)),
            _ => None,
        }
    }

    /// Whether this leaf always evaluates to a definite boolean on indexed
    /// points. Time and measurement comparisons qualify (a valid index holds
    /// only stamped rows, and every point has a measurement), as does
    /// existence. Tag and field predicates are undefined on points missing
    /// the key.
    fn is_total(&self) -> bool {
        match (&self.path, &self.test) {
            (_, LeafTest::Exists) => true,
            (Path::Time, _) | (Path::Measurement, _) => true,
            _ => false,
        }
    }
}

/// A composable predicate over points.
///
/// Built through [`TimeQuery`], [`MeasurementQuery`], [`TagQuery`] and
/// [`FieldQuery`]; combined with `&`, `|` and `!` (or nested directly).
#[derive(Debug, Clone)]
pub enum Query {
    Leaf(Leaf),
    Not(Box<Query>),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
}

impl Query {
    /// A query that matches every point. Useful as a base value when
    /// composing queries dynamically.
    pub fn noop() -> Query {
        leaf(Path::Measurement, LeafTest::StrTest(Rc::new(|_| true)))
    }

    /// Whether the point definitely satisfies this query.
    pub fn matches(&self, point: &Point) -> bool {
        self.eval(point) == Some(true)
    }

    /// Three-valued evaluation with short-circuiting (strong Kleene logic,
    /// under which De Morgan's laws hold exactly).
    pub(crate) fn eval(&self, point: &Point) -> Option<bool> {
        match self {
            Query::Leaf(l) => l.eval(point),
            Query::Not(q) => q.eval(point).map(|b| !b),
            Query::And(a, b) => match a.eval(point) {
                Some(false) => Some(false),
                lhs => match (lhs, b.eval(point)) {
                    (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                },
            },
            Query::Or(a, b) => match a.eval(point) {
                Some(true) => Some(true),
                lhs => match (lhs, b.eval(point)) {
                    (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                },
            },
        }
    }

    /// Partial evaluation against a valid index.
    ///
    /// Returns the candidate row-id set and the residual predicate that must
    /// still be checked against materialized candidates (`None` means the
    /// candidates are exact). Soundness contract: a stored point satisfies
    /// the query iff its row-id is a candidate and the point satisfies the
    /// residual.
    pub(crate) fn partial_eval(&self, index: &Index) -> (RowSet, Option<Query>) {
        match self {
            Query::Leaf(l) => match l.index_rows(index) {
                Some(rows) => (rows, None),
                None => (index.all_rows(), Some(self.clone())),
            },
            Query::Not(inner) => {
                let (rows, residual) = inner.partial_eval(index);
                if residual.is_none() && inner.is_total() {
                    (index.all_rows().difference(&rows), None)
                } else {
                    // Complementing is unsound when the inner query can be
                    // undefined on some rows (negation of "undefined" does
                    // not match); fall back to filtering the whole store.
                    (index.all_rows(), Some(self.clone()))
                }
            }
            Query::And(a, b) => {
                let (rows_a, res_a) = a.partial_eval(index);
                let (rows_b, res_b) = b.partial_eval(index);
                let residual = match (res_a, res_b) {
                    (None, None) => None,
                    (Some(r), None) | (None, Some(r)) => Some(r),
                    (Some(ra), Some(rb)) => Some(Query::And(Box::new(ra), Box::new(rb))),
                };
                (rows_a.intersect(&rows_b), residual)
            }
            Query::Or(a, b) => {
                let (rows_a, res_a) = a.partial_eval(index);
                let (rows_b, res_b) = b.partial_eval(index);
                if res_a.is_none() && res_b.is_none() {
                    (rows_a.union(&rows_b), None)
                } else {
                    (index.all_rows(), Some(self.clone()))
                }
            }
        }
    }

    /// Whether every leaf in this query is total on indexed points.
    fn is_total(&self) -> bool {
        match self {
            Query::Leaf(l) => l.is_total(),
            Query::Not(q) => q.is_total(),
            Query::And(a, b) | Query::Or(a, b) => a.is_total() && b.is_total(),
        }
    }
}

impl std::ops::BitAnd for Query {
    type Output = Query;

    fn bitand(self, rhs: Query) -> Query {
        Query::And(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::BitOr for Query {
    type Output = Query;

    fn bitor(self, rhs: Query) -> Query {
        Query::Or(Box::new(self), Box::new(rhs))
    }
}

impl std::ops::Not for Query {
    type Output = Query;

    fn not(self) -> Query {
        Query::Not(Box::new(self))
    }
}

fn leaf(path: Path, test: LeafTest) -> Query {
    Query::Leaf(Leaf { path, test })
}

/// Compiles a pattern that must match the whole value.
fn compile_full_match(pattern: &str) -> Result<Regex, TinyFluxError> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

/// Compiles a pattern that may match any substring of the value.
fn compile_search(pattern: &str) -> Result<Regex, TinyFluxError> {
    Ok(Regex::new(pattern)?)
}

/// Builder for predicates on the point timestamp.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use tinyflux::TimeQuery;
///
/// let t = Utc.with_ymd_and_hms(2020, 11, 1, 0, 0, 0).unwrap();
/// let q = TimeQuery::new().gte(t);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeQuery;

impl TimeQuery {
    pub fn new() -> Self {
        TimeQuery
    }

    fn cmp<Tz: TimeZone>(op: CmpOp, rhs: DateTime<Tz>) -> Query {
        leaf(Path::Time, LeafTest::TimeCmp(op, rhs.with_timezone(&Utc)))
    }

    pub fn eq<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Eq, rhs)
    }

    pub fn ne<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Ne, rhs)
    }

    pub fn lt<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Lt, rhs)
    }

    pub fn lte<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Le, rhs)
    }

    pub fn gt<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Gt, rhs)
    }

    pub fn gte<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        Self::cmp(CmpOp::Ge, rhs)
    }

    /// Applies `f` to the timestamp before comparing.
    pub fn map(self, f: impl Fn(DateTime<Utc>) -> DateTime<Utc> + 'static) -> TimeMapQuery {
        TimeMapQuery { f: Rc::new(f) }
    }

    /// Runs a user-supplied predicate against the timestamp. Never takes the
    /// index fast path.
    pub fn test(self, f: impl Fn(DateTime<Utc>) -> bool + 'static) -> Query {
        leaf(Path::Time, LeafTest::TimeTest(Rc::new(f)))
    }
}

/// A [`TimeQuery`] with a pending transform; finish with a comparison.
#[derive(Clone)]
pub struct TimeMapQuery {
    f: TimeMapFn,
}

impl TimeMapQuery {
    fn cmp<Tz: TimeZone>(self, op: CmpOp, rhs: DateTime<Tz>) -> Query {
        leaf(
            Path::Time,
            LeafTest::TimeMap(self.f, op, rhs.with_timezone(&Utc)),
        )
    }

    pub fn eq<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }

    pub fn lt<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Lt, rhs)
    }

    pub fn lte<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Le, rhs)
    }

    pub fn gt<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Gt, rhs)
    }

    pub fn gte<Tz: TimeZone>(self, rhs: DateTime<Tz>) -> Query {
        self.cmp(CmpOp::Ge, rhs)
    }
}

/// Builder for predicates on the measurement name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeasurementQuery;

impl MeasurementQuery {
    pub fn new() -> Self {
        MeasurementQuery
    }

    fn cmp(op: CmpOp, rhs: impl Into<String>) -> Query {
        leaf(Path::Measurement, LeafTest::StrCmp(op, rhs.into()))
    }

    pub fn eq(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Lt, rhs)
    }

    pub fn lte(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Gt, rhs)
    }

    pub fn gte(self, rhs: impl Into<String>) -> Query {
        Self::cmp(CmpOp::Ge, rhs)
    }

    /// Regex that must match the whole measurement name.
    pub fn matches(self, pattern: &str) -> Result<Query, TinyFluxError> {
        Ok(leaf(
            Path::Measurement,
            LeafTest::StrRegex(compile_full_match(pattern)?),
        ))
    }

    /// Regex that may match any substring of the measurement name.
    pub fn search(self, pattern: &str) -> Result<Query, TinyFluxError> {
        Ok(leaf(
            Path::Measurement,
            LeafTest::StrRegex(compile_search(pattern)?),
        ))
    }

    pub fn map(self, f: impl Fn(&str) -> String + 'static) -> MeasurementMapQuery {
        MeasurementMapQuery { f: Rc::new(f) }
    }

    pub fn test(self, f: impl Fn(&str) -> bool + 'static) -> Query {
        leaf(Path::Measurement, LeafTest::StrTest(Rc::new(f)))
    }
}

/// A [`MeasurementQuery`] with a pending transform.
#[derive(Clone)]
pub struct MeasurementMapQuery {
    f: StrMapFn,
}

impl MeasurementMapQuery {
    fn cmp(self, op: CmpOp, rhs: impl Into<String>) -> Query {
        leaf(Path::Measurement, LeafTest::StrMap(self.f, op, rhs.into()))
    }

    pub fn eq(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }
}

/// Builder for predicates on tag values; select the key first.
///
/// ```
/// use tinyflux::TagQuery;
///
/// let q = TagQuery::new().key("city").eq("LA");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TagQuery;

impl TagQuery {
    pub fn new() -> Self {
        TagQuery
    }

    /// Any string is a valid key, identifier or not.
    pub fn key(self, key: impl Into<String>) -> TagKeyQuery {
        TagKeyQuery { key: key.into() }
    }
}

/// A [`TagQuery`] scoped to one key.
#[derive(Debug, Clone)]
pub struct TagKeyQuery {
    key: String,
}

impl TagKeyQuery {
    fn cmp(self, op: CmpOp, rhs: impl Into<String>) -> Query {
        leaf(Path::Tag(self.key), LeafTest::StrCmp(op, rhs.into()))
    }

    pub fn eq(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Lt, rhs)
    }

    pub fn lte(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Gt, rhs)
    }

    pub fn gte(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Ge, rhs)
    }

    /// Matches points that carry this tag key, whatever the value.
    pub fn exists(self) -> Query {
        leaf(Path::Tag(self.key), LeafTest::Exists)
    }

    /// Regex that must match the whole tag value.
    pub fn matches(self, pattern: &str) -> Result<Query, TinyFluxError> {
        Ok(leaf(
            Path::Tag(self.key),
            LeafTest::StrRegex(compile_full_match(pattern)?),
        ))
    }

    /// Regex that may match any substring of the tag value.
    pub fn search(self, pattern: &str) -> Result<Query, TinyFluxError> {
        Ok(leaf(
            Path::Tag(self.key),
            LeafTest::StrRegex(compile_search(pattern)?),
        ))
    }

    pub fn map(self, f: impl Fn(&str) -> String + 'static) -> TagMapQuery {
        TagMapQuery {
            key: self.key,
            f: Rc::new(f),
        }
    }

    pub fn test(self, f: impl Fn(&str) -> bool + 'static) -> Query {
        leaf(Path::Tag(self.key), LeafTest::StrTest(Rc::new(f)))
    }
}

/// A [`TagKeyQuery`] with a pending transform.
#[derive(Clone)]
pub struct TagMapQuery {
    key: String,
    f: StrMapFn,
}

impl TagMapQuery {
    fn cmp(self, op: CmpOp, rhs: impl Into<String>) -> Query {
        leaf(Path::Tag(self.key), LeafTest::StrMap(self.f, op, rhs.into()))
    }

    pub fn eq(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<String>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }
}

/// Builder for predicates on field values; select the key first.
///
/// ```
/// use tinyflux::FieldQuery;
///
/// let q = FieldQuery::new().key("aqi").gt(120);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldQuery;

impl FieldQuery {
    pub fn new() -> Self {
        FieldQuery
    }

    pub fn key(self, key: impl Into<String>) -> FieldKeyQuery {
        FieldKeyQuery { key: key.into() }
    }
}

/// A [`FieldQuery`] scoped to one key.
#[derive(Debug, Clone)]
pub struct FieldKeyQuery {
    key: String,
}

impl FieldKeyQuery {
    fn cmp(self, op: CmpOp, rhs: impl Into<FieldValue>) -> Query {
        leaf(Path::Field(self.key), LeafTest::FieldCmp(op, rhs.into()))
    }

    pub fn eq(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Lt, rhs)
    }

    pub fn lte(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Gt, rhs)
    }

    pub fn gte(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Ge, rhs)
    }

    /// Matches points that carry this field key.
    pub fn exists(self) -> Query {
        leaf(Path::Field(self.key), LeafTest::Exists)
    }

    /// Applies `f` to the field value before comparing.
    pub fn map(self, f: impl Fn(&FieldValue) -> FieldValue + 'static) -> FieldMapQuery {
        FieldMapQuery {
            key: self.key,
            f: Rc::new(f),
        }
    }

    /// Runs a user-supplied predicate against the field value.
    pub fn test(self, f: impl Fn(&FieldValue) -> bool + 'static) -> Query {
        leaf(Path::Field(self.key), LeafTest::FieldTest(Rc::new(f)))
    }
}

/// A [`FieldKeyQuery`] with a pending transform.
#[derive(Clone)]
pub struct FieldMapQuery {
    key: String,
    f: FieldMapFn,
}

impl FieldMapQuery {
    fn cmp(self, op: CmpOp, rhs: impl Into<FieldValue>) -> Query {
        leaf(
            Path::Field(self.key),
            LeafTest::FieldMap(self.f, op, rhs.into()),
        )
    }

    pub fn eq(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Eq, rhs)
    }

    pub fn ne(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Lt, rhs)
    }

    pub fn lte(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Gt, rhs)
    }

    pub fn gte(self, rhs: impl Into<FieldValue>) -> Query {
        self.cmp(CmpOp::Ge, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::Cell;

    fn point_la() -> Point {
        Point::new()
            .with_time(Utc.with_ymd_and_hms(2020, 8, 28, 7, 0, 0).unwrap())
            .with_tag("city", "LA")
            .with_field("aqi", 112)
    }

    #[test]
    fn tag_equality() {
        let q = TagQuery::new().key("city").eq("LA");
        assert!(q.matches(&point_la()));
        let q = TagQuery::new().key("city").eq("SF");
        assert!(!q.matches(&point_la()));
    }

    #[test]
    fn missing_attribute_comparison_is_false() {
        let q = TagQuery::new().key("state").eq("CA");
        assert!(!q.matches(&point_la()));
    }

    #[test]
    fn negated_missing_attribute_is_still_false() {
        let q = !TagQuery::new().key("state").eq("CA");
        assert!(!q.matches(&point_la()));

        let q = !TagQuery::new().key("city").eq("SF");
        assert!(q.matches(&point_la()));
    }

    #[test]
    fn field_comparisons_are_numeric_across_kinds() {
        let p = point_la();
        assert!(FieldQuery::new().key("aqi").gt(100).matches(&p));
        assert!(FieldQuery::new().key("aqi").eq(112.0).matches(&p));
        assert!(!FieldQuery::new().key("aqi").lt(12).matches(&p));
    }

    #[test]
    fn and_short_circuits_on_definite_false() {
        let evaluated = Rc::new(Cell::new(false));
        let seen = evaluated.clone();
        let right = FieldQuery::new().key("aqi").test(move |_| {
            seen.set(true);
            true
        });
        let q = TagQuery::new().key("city").eq("SF") & right;
        assert!(!q.matches(&point_la()));
        assert!(!evaluated.get());
    }

    #[test]
    fn or_short_circuits_on_definite_true() {
        let evaluated = Rc::new(Cell::new(false));
        let seen = evaluated.clone();
        let right = FieldQuery::new().key("aqi").test(move |_| {
            seen.set(true);
            false
        });
        let q = TagQuery::new().key("city").eq("LA") | right;
        assert!(q.matches(&point_la()));
        assert!(!evaluated.get());
    }

    #[test]
    fn de_morgan_holds_with_missing_attributes() {
        let points = [
            point_la(),
            Point::new().with_time(Utc::now()).with_tag("city", "SF"),
            Point::new().with_time(Utc::now()).with_field("aqi", 50),
            Point::new().with_time(Utc::now()),
        ];
        for p in &points {
            let a = || TagQuery::new().key("city").eq("LA");
            let b = || FieldQuery::new().key("aqi").gt(100);
            let lhs = !(a() & b());
            let rhs = !a() | !b();
            assert_eq!(lhs.matches(p), rhs.matches(p), "point {:?}", p);
        }
    }

    #[test]
    fn regex_full_match_vs_search() {
        let p = Point::new().with_time(Utc::now()).with_tag("host", "server-12");
        let full = TagQuery::new().key("host").matches(r"server-\d+").unwrap();
        assert!(full.matches(&p));
        let full_prefix = TagQuery::new().key("host").matches("server").unwrap();
        assert!(!full_prefix.matches(&p));
        let sub = TagQuery::new().key("host").search("server").unwrap();
        assert!(sub.matches(&p));
    }

    #[test]
    fn bad_pattern_surfaces_regex_error() {
        let err = MeasurementQuery::new().matches("(").unwrap_err();
        assert!(matches!(err, TinyFluxError::Regex(_)));
    }

    #[test]
    fn time_map_transform() {
        use chrono::Datelike;
        let q = TimeQuery::new()
            .map(|t| t.with_day(1).unwrap_or(t))
            .eq(Utc.with_ymd_and_hms(2020, 8, 1, 7, 0, 0).unwrap());
        assert!(q.matches(&point_la()));
    }

    #[test]
    fn measurement_transform_and_test() {
        let p = Point::new().with_time(Utc::now()).with_measurement("Kitchen");
        let q = MeasurementQuery::new().map(|m| m.to_lowercase()).eq("kitchen");
        assert!(q.matches(&p));
        let q = MeasurementQuery::new().test(|m| m.len() > 3);
        assert!(q.matches(&p));
    }

    #[test]
    fn exists_is_total_so_its_negation_matches() {
        let p = point_la();
        assert!(TagQuery::new().key("city").exists().matches(&p));
        assert!(!TagQuery::new().key("state").exists().matches(&p));
        assert!((!TagQuery::new().key("state").exists()).matches(&p));
        assert!((!FieldQuery::new().key("humidity").exists()).matches(&p));
    }

    #[test]
    fn noop_matches_everything() {
        assert!(Query::noop().matches(&point_la()));
        assert!(Query::noop().matches(&Point::new()));
    }

    #[test]
    fn unstamped_point_fails_time_comparisons() {
        let q = TimeQuery::new().lte(Utc::now());
        assert!(!q.matches(&Point::new()));
        assert!(!(!TimeQuery::new().lte(Utc::now())).matches(&Point::new()));
    }
}
