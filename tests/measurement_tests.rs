use chrono::{DateTime, TimeZone, Utc};
use tinyflux::*;

fn t(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
}

fn seeded_db() -> TinyFlux<MemoryStorage> {
    let mut db = TinyFlux::memory();
    for i in 0..100u32 {
        let name = if i % 2 == 0 { "A" } else { "B" };
        db.insert(
            Point::new()
                .with_time(t(i))
                .with_measurement(name)
                .with_tag("sensor", if i % 4 == 0 { "s0" } else { "s1" })
                .with_field("n", i as i64),
        )
        .unwrap();
    }
    db
}

#[test]
fn view_scopes_all_and_len() {
    let mut db = seeded_db();
    let mut m = db.measurement("A");
    let points = m.all().unwrap();
    assert_eq!(points.len(), 50);
    assert!(points.iter().all(|p| p.measurement == "A"));
    assert_eq!(m.len().unwrap(), 50);
}

#[test]
fn view_insert_stamps_measurement() {
    let mut db = seeded_db();
    {
        let mut m = db.measurement("A");
        m.insert(Point::new()).unwrap();
    }
    // The default-measurement point was claimed by the view.
    assert_eq!(db.measurement("A").len().unwrap(), 51);
    assert!(!db
        .get_measurements()
        .unwrap()
        .contains(&DEFAULT_MEASUREMENT.to_string()));
}

#[test]
fn view_queries_are_anded_with_the_measurement() {
    let mut db = seeded_db();
    let mut m = db.measurement("A");

    // Odd n values only exist on measurement B.
    assert_eq!(m.count(&FieldQuery::new().key("n").eq(1)).unwrap(), 0);
    assert_eq!(m.count(&FieldQuery::new().key("n").eq(2)).unwrap(), 1);
    assert!(!m.contains(&FieldQuery::new().key("n").eq(99)).unwrap());

    let within = m
        .search(&(TimeQuery::new().gte(t(0)) & TimeQuery::new().lt(t(10))))
        .unwrap();
    assert_eq!(within.len(), 5);
}

#[test]
fn view_get_respects_sorted_order() {
    let mut db = seeded_db();
    let mut m = db.measurement("B");
    let first = m.get(&TagQuery::new().key("sensor").eq("s1")).unwrap().unwrap();
    assert_eq!(first.fields["n"], FieldValue::Integer(1));
}

#[test]
fn view_update_and_remove_do_not_leak() {
    let mut db = seeded_db();
    {
        let mut m = db.measurement("B");
        let changed = m
            .update_all(&Update::new().tags(TagSet::from([(
                "checked".to_string(),
                "yes".to_string(),
            )])))
            .unwrap();
        assert_eq!(changed, 50);
    }
    for p in db.all().unwrap() {
        assert_eq!(p.tags.contains_key("checked"), p.measurement == "B");
    }

    {
        let mut m = db.measurement("B");
        assert_eq!(m.remove(&FieldQuery::new().key("n").lt(50)).unwrap(), 25);
    }
    assert_eq!(db.len().unwrap(), 75);
    // A-points were untouched.
    assert_eq!(db.measurement("A").len().unwrap(), 50);
}

#[test]
fn view_select_and_insert_multiple() {
    let mut db = TinyFlux::memory();
    {
        let mut m = db.measurement("rooms");
        m.insert_multiple(
            (0..6).map(|i| Point::new().with_time(t(i)).with_field("n", i as i64)),
            2,
        )
        .unwrap();
        let rows = m.select(&["measurement", "fields.n"], &Query::noop()).unwrap();
        assert_eq!(rows.len(), 6);
        assert!(rows
            .iter()
            .all(|r| r[0] == Some(AttrValue::Str("rooms".to_string()))));
    }
    assert_eq!(db.get_measurements().unwrap(), vec!["rooms"]);
}
