use std::sync::Arc;

use corral_core::error::SessionErrorKind;
use corral_core::{Attribute, Connection, EntityDef, Error, ErrorKind, Schema, SqlType, Value};
use corral_query::{Query, RawSql, lit, var};
use corral_schema::create_all;
use corral_session::{
    Session, SessionConfig, Status, ToJsonOptions, TransactionMode, TransactionState,
};
use corral_sqlite::SqliteConnection;

fn garage() -> Schema {
    Schema::builder()
        .entity(
            EntityDef::new("Person")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text).unique())
                .attr(Attribute::optional("age", SqlType::Integer).default(0))
                .attr(Attribute::set("cars", "Car"))
                .attr(Attribute::set("tools", "Tool"))
                .attr(Attribute::set("licenses", "License").cascade_delete(false))
                .attr(Attribute::optional_ref("passport", "Passport")),
        )
        .entity(
            EntityDef::new("Car")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("make", SqlType::Text))
                .attr(Attribute::required_ref("owner", "Person")),
        )
        .entity(
            EntityDef::new("Tool")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text))
                .attr(Attribute::optional_ref("keeper", "Person")),
        )
        .entity(
            EntityDef::new("License")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required_ref("holder", "Person")),
        )
        .entity(
            EntityDef::new("Passport")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("number", SqlType::Text))
                .attr(Attribute::required_ref("person", "Person")),
        )
        .entity(
            EntityDef::new("Student")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text))
                .attr(Attribute::set("courses", "Course")),
        )
        .entity(
            EntityDef::new("Course")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("title", SqlType::Text))
                .attr(Attribute::set("students", "Student")),
        )
        .build()
        .unwrap()
}

fn memory_session() -> Session {
    let schema = Arc::new(garage());
    let conn = SqliteConnection::open_memory().unwrap();
    create_all(&conn, &schema).unwrap();
    Session::new(schema, Box::new(conn))
}

/// Two sessions over the same database file.
fn file_sessions(dir: &tempfile::TempDir) -> (Session, Session) {
    let schema = Arc::new(garage());
    let path = dir.path().join("garage.db");
    let path = path.to_str().unwrap().to_string();
    let setup = SqliteConnection::open_file(path.clone()).unwrap();
    create_all(&setup, &schema).unwrap();
    let a = Session::new(schema.clone(), Box::new(SqliteConnection::open_file(path.clone()).unwrap()));
    let b = Session::new(schema, Box::new(SqliteConnection::open_file(path).unwrap()));
    (a, b)
}

/// Two strict-mode sessions over one file holding Ann.
fn strict_sessions(dir: &tempfile::TempDir) -> (Session, Session) {
    let (seed, _) = file_sessions(dir);
    seed.create("Person", vec![("name", "Ann".into())]).unwrap();
    seed.commit().unwrap();
    let schema = Arc::new(garage());
    let path = dir.path().join("garage.db");
    let strict = || {
        let conn = SqliteConnection::open_file(path.to_str().unwrap()).unwrap();
        Session::with_config(
            schema.clone(),
            Box::new(conn),
            SessionConfig::new().mode(TransactionMode::Strict),
        )
    };
    (strict(), strict())
}

fn people() -> Query {
    Query::select("p", "Person")
}

#[test]
fn store_assigns_keys_on_flush() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    assert_eq!(ann.key().unwrap(), None);
    assert_eq!(ann.status().unwrap(), Status::Created);
    assert_eq!(ann.get("age").unwrap(), Value::Int(0));

    let result = s.flush().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(ann.key().unwrap(), Some(vec![Value::BigInt(1)]));
    assert_eq!(ann.status().unwrap(), Status::Inserted);
    assert!(s.in_transaction());
}

#[test]
fn loading_a_row_twice_yields_the_same_object() {
    let s = memory_session();
    s.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])
        .unwrap();
    s.commit().unwrap();

    let first = s.get("Person", 1).unwrap();
    let second = s.get("Person", 1i64).unwrap();
    assert!(first.ptr_eq(&second));

    let fetched = s
        .fetch_entities(&people().filter(var("p").attr("age").ge(lit(30))))
        .unwrap();
    assert_eq!(fetched, vec![first.clone()]);
    assert_eq!(s.len(), 1);

    first.set("age", 31).unwrap();
    assert_eq!(second.get_as::<i64>("age").unwrap(), 31);
}

#[test]
fn handles_expire_when_the_transaction_ends() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    s.commit().unwrap();

    let err = ann.get("name").unwrap_err();
    assert!(matches!(err, Error::Session(ref e) if e.kind == SessionErrorKind::Expired));
    assert!(!s.owns(&ann));

    // The session keeps working with fresh handles.
    let ann = s.get("Person", 1).unwrap();
    assert_eq!(ann.get("name").unwrap(), Value::from("Ann"));
    assert!(s.owns(&ann));
}

#[test]
fn get_by_unique_and_ambiguous_criteria() {
    let s = memory_session();
    s.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])
        .unwrap();
    s.create("Person", vec![("name", "Bob".into()), ("age", 30.into())])
        .unwrap();

    let bob = s.get_by("Person", &[("name", Value::from("Bob"))]).unwrap();
    assert_eq!(bob.unwrap().get("name").unwrap(), Value::from("Bob"));

    let err = s.get_by("Person", &[("age", Value::Int(30))]).unwrap_err();
    assert!(matches!(err, Error::MultipleFound(_)));

    assert!(s.get_by("Person", &[("name", Value::from("Cid"))]).unwrap().is_none());
    assert!(matches!(s.get("Person", 99), Err(Error::NotFound(_))));
}

#[test]
fn create_rejects_bad_values_without_side_effects() {
    let s = memory_session();
    let err = s
        .create("Car", vec![("make", "Toyota".into())])
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ref v) if v.errors[0].attr == "owner"));
    assert!(s.is_empty());

    let err = s.create("Person", vec![("nickname", "A".into())]).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
}

#[test]
fn references_keep_both_sides_in_step() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    s.create("Person", vec![("name", "Bob".into())]).unwrap();
    s.create("Car", vec![("make", "Toyota".into()), ("owner", (&ann).into())])
        .unwrap();
    s.commit().unwrap();

    let ann = s.get("Person", 1).unwrap();
    let bob = s.get("Person", 2).unwrap();
    let cars = ann.members("cars").unwrap();
    assert_eq!(cars.len(), 1);

    cars[0].set("owner", &bob).unwrap();
    assert!(ann.members("cars").unwrap().is_empty());
    assert!(bob.has_member("cars", &cars[0]).unwrap());
    s.commit().unwrap();

    let bob = s.get("Person", 2).unwrap();
    assert_eq!(bob.count_members("cars").unwrap(), 1);
    let car = s.get("Car", 1).unwrap();
    assert_eq!(car.get_ref("owner").unwrap(), Some(bob));
}

#[test]
fn one_to_one_partner_is_visible_from_both_sides() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    let passport = s
        .create("Passport", vec![("number", "X1".into()), ("person", (&ann).into())])
        .unwrap();
    assert_eq!(ann.get_ref("passport").unwrap(), Some(passport));
    s.commit().unwrap();

    let ann = s.get("Person", 1).unwrap();
    let passport = ann.get_ref("passport").unwrap().unwrap();
    assert_eq!(passport.get("number").unwrap(), Value::from("X1"));
}

#[test]
fn many_to_many_links_are_written_once() {
    let s = memory_session();
    let ann = s.create("Student", vec![("name", "Ann".into())]).unwrap();
    let math = s.create("Course", vec![("title", "Math".into())]).unwrap();
    ann.add("courses", &math).unwrap();
    assert!(math.has_member("students", &ann).unwrap());
    let result = s.flush().unwrap();
    assert_eq!(result.links_added, 1);
    s.commit().unwrap();

    let math = s.get("Course", 1).unwrap();
    assert_eq!(math.count_members("students").unwrap(), 1);
    let ann = s.get("Student", 1).unwrap();
    ann.remove("courses", &math).unwrap();
    // Re-adding cancels the pending removal.
    ann.add("courses", &math).unwrap();
    ann.remove("courses", &math).unwrap();
    assert_eq!(s.flush().unwrap().links_removed, 1);
    s.commit().unwrap();

    let rows = s
        .connection()
        .query("SELECT COUNT(*) FROM \"Course_Student\"", &[])
        .unwrap();
    assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 0);
}

#[test]
fn delete_cascades_to_required_dependents() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    for make in ["Toyota", "Volvo"] {
        s.create("Car", vec![("make", make.into()), ("owner", (&ann).into())])
            .unwrap();
    }
    s.create("Passport", vec![("number", "X1".into()), ("person", (&ann).into())])
        .unwrap();
    s.commit().unwrap();

    let ann = s.get("Person", 1).unwrap();
    ann.delete().unwrap();
    assert_eq!(ann.status().unwrap(), Status::MarkedToDelete);
    assert!(matches!(
        ann.get("name"),
        Err(Error::Session(ref e)) if e.kind == SessionErrorKind::ObjectDeleted
    ));
    let result = s.flush().unwrap();
    assert_eq!(result.deleted, 4);
    s.commit().unwrap();

    assert_eq!(s.count(&Query::select("c", "Car")).unwrap(), 0);
    assert_eq!(s.count(&Query::select("p", "Passport")).unwrap(), 0);
}

#[test]
fn delete_detaches_optional_dependents() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    let hammer = s
        .create("Tool", vec![("name", "Hammer".into()), ("keeper", (&ann).into())])
        .unwrap();
    ann.delete().unwrap();
    assert_eq!(ann.status().unwrap(), Status::Cancelled);
    assert_eq!(hammer.get_ref("keeper").unwrap(), None);
    s.commit().unwrap();

    let rows = s
        .connection()
        .query("SELECT \"keeper\" FROM \"Tool\"", &[])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].get(0).unwrap().is_null());
}

#[test]
fn delete_blocked_by_required_dependent_changes_nothing() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    let car = s
        .create("Car", vec![("make", "Volvo".into()), ("owner", (&ann).into())])
        .unwrap();
    s.create("License", vec![("holder", (&ann).into())]).unwrap();

    let err = ann.delete().unwrap_err();
    assert!(matches!(err, Error::Constraint(_)));
    assert_eq!(ann.status().unwrap(), Status::Created);
    assert_eq!(car.status().unwrap(), Status::Created);
    assert_eq!(ann.members("cars").unwrap(), vec![car]);
}

#[test]
fn concurrent_change_to_a_read_value_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = file_sessions(&dir);
    b.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])
        .unwrap();
    b.commit().unwrap();

    let ann = a.get("Person", 1).unwrap();
    assert_eq!(ann.get_as::<i64>("age").unwrap(), 30);

    b.get("Person", 1).unwrap().set("age", 31).unwrap();
    b.commit().unwrap();

    ann.set("age", 40).unwrap();
    let err = a.commit().unwrap_err();
    assert!(matches!(err, Error::Conflict(ref c) if c.attrs == vec!["age".to_string()]));
    assert!(err.is_retryable());

    let ann = b.get("Person", 1).unwrap();
    assert_eq!(ann.get_as::<i64>("age").unwrap(), 31);
}

#[test]
fn update_writes_only_modified_columns() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = file_sessions(&dir);
    b.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])
        .unwrap();
    b.commit().unwrap();

    let ann = a.get("Person", 1).unwrap();
    assert_eq!(ann.get("name").unwrap(), Value::from("Ann"));

    b.get("Person", 1).unwrap().set("age", 50).unwrap();
    b.commit().unwrap();

    ann.set("name", "Anna").unwrap();
    a.commit().unwrap();

    let ann = b.get("Person", 1).unwrap();
    assert_eq!(ann.get("name").unwrap(), Value::from("Anna"));
    assert_eq!(ann.get_as::<i64>("age").unwrap(), 50);
}

#[test]
fn nested_scopes_commit_once() {
    let s = memory_session();
    s.scope(|s| {
        s.create("Person", vec![("name", "Ann".into())])?;
        s.scope(|s| {
            s.create("Person", vec![("name", "Bob".into())])?;
            Ok(())
        })?;
        assert!(s.has_changes());
        Ok(())
    })
    .unwrap();
    assert!(!s.has_changes());
    assert_eq!(s.count(&people()).unwrap(), 2);

    let failed: corral_core::Result<()> = s.scope(|s| {
        s.create("Person", vec![("name", "Cid".into())])?;
        s.flush()?;
        Err(Error::Custom("boom".into()))
    });
    assert!(failed.is_err());
    assert_eq!(s.count(&people()).unwrap(), 2);
}

#[test]
fn raw_sql_fetch_joins_the_identity_map() {
    let s = memory_session();
    let ann = s
        .create("Person", vec![("name", "Ann".into()), ("age", 30.into())])
        .unwrap();
    s.create("Person", vec![("name", "Bob".into()), ("age", 20.into())])
        .unwrap();

    let found = s
        .fetch_by_sql(
            "Person",
            &RawSql::new("SELECT * FROM \"Person\" WHERE \"age\" >= $min").param("min", 25),
        )
        .unwrap();
    assert_eq!(found, vec![ann]);
}

#[test]
fn to_json_renders_keys_for_relationships() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into())]).unwrap();
    s.create("Car", vec![("make", "Volvo".into()), ("owner", (&ann).into())])
        .unwrap();
    s.flush().unwrap();

    let json = ann
        .to_json(&ToJsonOptions::new().only(["name", "cars"]))
        .unwrap();
    assert_eq!(json["name"], "Ann");
    assert_eq!(json["cars"], serde_json::json!([1]));
    assert!(json.get("age").is_none());

    let err = ann.to_json(&ToJsonOptions::new().exclude(["nope"])).unwrap_err();
    assert!(matches!(err, Error::MalformedQuery(_)));
}

#[test]
fn lock_inside_a_strict_read_transaction_takes_the_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = strict_sessions(&dir);

    assert!(a.try_get("Person", 1).unwrap().is_some());
    assert!(a.in_transaction());
    let ann = a.get_for_update("Person", 1, true).unwrap();
    assert_eq!(ann.get("name").unwrap(), Value::from("Ann"));

    // a read transaction on the other side cannot take the lock either
    assert!(b.try_get("Person", 1).unwrap().is_some());
    let err = b.get_for_update("Person", 1, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = b.fetch(&people().for_update(true)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    a.commit().unwrap();
    let ann = b.get_for_update("Person", 1, true).unwrap();
    ann.set("age", 41).unwrap();
    b.commit().unwrap();
    assert_eq!(a.get("Person", 1).unwrap().get_as::<i64>("age").unwrap(), 41);
}

#[test]
fn locking_query_opens_a_write_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = file_sessions(&dir);
    a.create("Person", vec![("name", "Ann".into())]).unwrap();
    a.commit().unwrap();

    let locked = a.fetch_entities(&people().for_update(false)).unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(a.transaction_state(), TransactionState::Active);
    let err = b.get_for_update("Person", 1, true).unwrap_err();
    assert!(err.is_retryable());
    a.rollback().unwrap();
    assert!(b.get_for_update("Person", 1, true).is_ok());
}

#[test]
fn failed_savepoint_restores_objects_and_rows() {
    let s = memory_session();
    let ann = s.create("Person", vec![("name", "Ann".into()), ("age", 30.into())]).unwrap();
    s.flush().unwrap();

    let failed: corral_core::Result<()> = s.savepoint(|s| {
        ann.set("age", 50)?;
        s.create("Person", vec![("name", "Bob".into())])?;
        s.flush()?;
        Err(Error::Custom("boom".into()))
    });
    assert!(matches!(failed, Err(Error::Custom(_))));
    assert!(!s.has_changes());
    assert_eq!(s.len(), 1);
    assert_eq!(ann.get_as::<i64>("age").unwrap(), 30);
    assert!(s.in_transaction());

    let bob = s
        .savepoint(|s| s.create("Person", vec![("name", "Bob".into())]))
        .unwrap();
    s.commit().unwrap();
    assert!(bob.get("name").is_err());
    assert_eq!(s.count(&people()).unwrap(), 2);
    let ann = s.get_by("Person", &[("name", Value::from("Ann"))]).unwrap().unwrap();
    assert_eq!(ann.get_as::<i64>("age").unwrap(), 30);
}
