use corral_core::{Attribute, Connection, EntityDef, Schema, SqlType, Value};
use corral_schema::{create_all, drop_all};
use corral_sqlite::SqliteConnection;

fn school() -> Schema {
    Schema::builder()
        .entity(
            EntityDef::new("Student")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text).unique())
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

fn table_names(conn: &SqliteConnection) -> Vec<String> {
    conn.query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        &[],
    )
    .unwrap()
    .iter()
    .map(|r| r.get_as::<String>(0).unwrap())
    .collect()
}

#[test]
fn create_all_builds_entity_and_link_tables() {
    let conn = SqliteConnection::open_memory().unwrap();
    let schema = school();
    create_all(&conn, &schema).unwrap();
    assert_eq!(table_names(&conn), vec!["Course", "Course_Student", "Student"]);

    // Running twice is harmless.
    create_all(&conn, &schema).unwrap();

    let student = conn
        .insert("INSERT INTO \"Student\" (\"name\") VALUES (?1)", &[Value::from("Ann")])
        .unwrap();
    let course = conn
        .insert("INSERT INTO \"Course\" (\"title\") VALUES (?1)", &[Value::from("Math")])
        .unwrap();
    conn.execute(
        "INSERT INTO \"Course_Student\" (\"course\", \"student\") VALUES (?1, ?2)",
        &[Value::BigInt(course), Value::BigInt(student)],
    )
    .unwrap();

    // Foreign keys and the link key are enforced.
    assert!(
        conn.execute(
            "INSERT INTO \"Course_Student\" (\"course\", \"student\") VALUES (?1, ?2)",
            &[Value::BigInt(course), Value::BigInt(99)],
        )
        .is_err()
    );
    assert!(
        conn.execute(
            "INSERT INTO \"Course_Student\" (\"course\", \"student\") VALUES (?1, ?2)",
            &[Value::BigInt(course), Value::BigInt(student)],
        )
        .is_err()
    );
    assert!(
        conn.execute("INSERT INTO \"Student\" (\"name\") VALUES (?1)", &[Value::from("Ann")])
            .is_err()
    );
}

#[test]
fn drop_all_removes_every_table() {
    let conn = SqliteConnection::open_memory().unwrap();
    let schema = school();
    create_all(&conn, &schema).unwrap();
    drop_all(&conn, &schema).unwrap();
    assert!(table_names(&conn).is_empty());
}
