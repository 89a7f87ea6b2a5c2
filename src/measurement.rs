//! A scoped view over one measurement.
//!
//! The view injects `measurement == name` into every query, stamps inserted
//! points with its name, and forwards everything else to the parent engine.
//! A measurement does not need any stored points for a view to exist.

use crate::database::{AttrValue, TinyFlux, Update};
use crate::error::TinyFluxError;
use crate::point::Point;
use crate::query::{MeasurementQuery, Query};
use crate::storage::Storage;

/// Scoped façade produced by [`TinyFlux::measurement`].
#[derive(Debug)]
pub struct Measurement<'db, S: Storage> {
    name: String,
    db: &'db mut TinyFlux<S>,
}

impl<'db, S: Storage> Measurement<'db, S> {
    pub(crate) fn new(name: String, db: &'db mut TinyFlux<S>) -> Self {
        Measurement { name, db }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn name_query(&self) -> Query {
        MeasurementQuery::new().eq(self.name.as_str())
    }

    fn scoped(&self, query: &Query) -> Query {
        self.name_query() & query.clone()
    }

    /// Inserts the point into this measurement, overriding whatever
    /// measurement the point carried.
    pub fn insert(&mut self, mut point: Point) -> Result<usize, TinyFluxError> {
        point.measurement = self.name.clone();
        self.db.insert(point)
    }

    /// Inserts points in iteration order, all stamped with this
    /// measurement's name.
    pub fn insert_multiple<I>(&mut self, points: I, batch_size: usize) -> Result<usize, TinyFluxError>
    where
        I: IntoIterator<Item = Point>,
    {
        let name = self.name.clone();
        self.db.insert_multiple(
            points.into_iter().map(move |mut p| {
                p.measurement = name.clone();
                p
            }),
            batch_size,
        )
    }

    pub fn search(&mut self, query: &Query) -> Result<Vec<Point>, TinyFluxError> {
        self.db.search(&self.scoped(query))
    }

    pub fn search_with(
        &mut self,
        query: &Query,
        sorted: bool,
    ) -> Result<Vec<Point>, TinyFluxError> {
        self.db.search_with(&self.scoped(query), sorted)
    }

    pub fn count(&mut self, query: &Query) -> Result<usize, TinyFluxError> {
        self.db.count(&self.scoped(query))
    }

    pub fn contains(&mut self, query: &Query) -> Result<bool, TinyFluxError> {
        self.db.contains(&self.scoped(query))
    }

    pub fn get(&mut self, query: &Query) -> Result<Option<Point>, TinyFluxError> {
        self.db.get(&self.scoped(query))
    }

    pub fn select(
        &mut self,
        paths: &[&str],
        query: &Query,
    ) -> Result<Vec<Vec<Option<AttrValue>>>, TinyFluxError> {
        self.db.select(paths, &self.scoped(query))
    }

    /// Every point in this measurement, sorted by time ascending.
    pub fn all(&mut self) -> Result<Vec<Point>, TinyFluxError> {
        self.db.search(&self.name_query())
    }

    pub fn all_with(&mut self, sorted: bool) -> Result<Vec<Point>, TinyFluxError> {
        self.db.search_with(&self.name_query(), sorted)
    }

    /// Number of points in this measurement.
    pub fn len(&mut self) -> Result<usize, TinyFluxError> {
        self.db.count(&self.name_query())
    }

    pub fn is_empty(&mut self) -> Result<bool, TinyFluxError> {
        Ok(self.len()? == 0)
    }

    pub fn update(&mut self, query: &Query, update: &Update) -> Result<usize, TinyFluxError> {
        self.db.update(&self.scoped(query), update)
    }

    /// Updates every point in this measurement.
    pub fn update_all(&mut self, update: &Update) -> Result<usize, TinyFluxError> {
        self.db.update(&self.name_query(), update)
    }

    pub fn remove(&mut self, query: &Query) -> Result<usize, TinyFluxError> {
        self.db.remove(&self.scoped(query))
    }

    /// Drops every point in this measurement, returning the count.
    pub fn remove_all(&mut self) -> Result<usize, TinyFluxError> {
        self.db.remove(&self.name_query())
    }
}
