use std::cell::Cell;

use corral::prelude::*;
use corral::{PoolConfig, TransactionState};

fn shop() -> Schema {
    Schema::builder()
        .entity(
            EntityDef::new("Customer")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text).unique())
                .attr(Attribute::optional("credit", SqlType::Integer).default(0))
                .attr(Attribute::set("orders", "Order")),
        )
        .entity(
            EntityDef::new("Order")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("total", SqlType::Integer))
                .attr(Attribute::required_ref("customer", "Customer")),
        )
        .build()
        .unwrap()
}

fn file_database(dir: &tempfile::TempDir) -> Database {
    let path = dir.path().join("shop.db");
    let config = DatabaseConfig::sqlite_file(path.to_str().unwrap()).pool(PoolConfig::new(4));
    let db = Database::open(shop(), config).unwrap();
    db.create_tables().unwrap();
    db
}

#[test]
fn ok_commits_and_err_rolls_back() {
    let db = Database::memory(shop()).unwrap();
    db.create_tables().unwrap();

    db.session(|s| {
        s.create("Customer", vec![("name", "Ann".into())])?;
        Ok(())
    })
    .unwrap();

    let err = db
        .session(|s| {
            s.create("Customer", vec![("name", "Bob".into())])?;
            s.flush()?;
            Err::<(), _>(Error::Custom("changed my mind".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));

    let names = db
        .session(|s| s.fetch_values(&Query::select("c", "Customer").project([var("c").attr("name")])))
        .unwrap();
    assert_eq!(names, vec![Value::from("Ann")]);
}

#[test]
fn connections_return_to_the_pool() {
    let db = Database::memory(shop()).unwrap();
    assert_eq!(db.config().pool.max_connections, 1);
    db.create_tables().unwrap();

    for _ in 0..3 {
        db.session(|s| s.count(&Query::select("c", "Customer"))).unwrap();
    }
    let stats = db.pool_stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.connections_created, 1);
}

#[test]
fn retry_reruns_the_session_after_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir);
    db.session(|s| {
        s.create("Customer", vec![("name", "Ann".into()), ("credit", 10.into())])?;
        Ok(())
    })
    .unwrap();

    let runs = Cell::new(0);
    let policy = RetryPolicy::new(3).retry_on([ErrorKind::Conflict]);
    let credit = db
        .session_with_retry(&policy, |s| {
            runs.set(runs.get() + 1);
            let ann = s.get("Customer", 1)?;
            let credit = ann.get_as::<i64>("credit")?;
            if runs.get() == 1 {
                // another writer gets in between the read and the write
                db.session(|other| other.get("Customer", 1)?.set("credit", 99))?;
            }
            ann.set("credit", credit + 5)?;
            Ok(credit + 5)
        })
        .unwrap();
    assert_eq!(runs.get(), 2);
    assert_eq!(credit, 104);

    let stored = db
        .session(|s| s.get("Customer", 1)?.get_as::<i64>("credit"))
        .unwrap();
    assert_eq!(stored, 104);
}

#[test]
fn retry_gives_up_after_the_last_attempt() {
    let db = Database::memory(shop()).unwrap();
    db.create_tables().unwrap();
    let runs = Cell::new(0);
    let policy = RetryPolicy::new(2).retry_on([ErrorKind::Custom]);
    let err = db
        .session_with_retry(&policy, |_| {
            runs.set(runs.get() + 1);
            Err::<(), _>(Error::Custom("still failing".into()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));
    assert_eq!(runs.get(), 2);
}

#[test]
fn file_database_is_shared_between_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let db = file_database(&dir);
    db.session(|s| {
        let ann = s.create("Customer", vec![("name", "Ann".into())])?;
        s.create("Order", vec![("total", 12.into()), ("customer", (&ann).into())])?;
        s.create("Order", vec![("total", 30.into()), ("customer", (&ann).into())])?;
        Ok(())
    })
    .unwrap();

    let reopened = Database::open(
        shop(),
        DatabaseConfig::sqlite_file(dir.path().join("shop.db").to_str().unwrap()),
    )
    .unwrap();
    let totals = reopened
        .session(|s| {
            let ann = s.get_by("Customer", &[("name", Value::from("Ann"))])?.unwrap();
            let mut totals = ann
                .members("orders")?
                .iter()
                .map(|o| o.get_as::<i64>("total"))
                .collect::<Result<Vec<_>>>()?;
            totals.sort_unstable();
            Ok(totals)
        })
        .unwrap();
    assert_eq!(totals, vec![12, 30]);
}

#[test]
fn strict_mode_opens_the_transaction_on_first_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strict.db");
    let config = DatabaseConfig::sqlite_file(path.to_str().unwrap()).mode(TransactionMode::Strict);
    let db = Database::open(shop(), config).unwrap();
    db.create_tables().unwrap();

    db.session(|s| {
        assert_eq!(s.transaction_state(), TransactionState::NoTransaction);
        s.count(&Query::select("c", "Customer"))?;
        assert!(s.in_transaction());
        Ok(())
    })
    .unwrap();

    let relaxed = Database::open(shop(), DatabaseConfig::sqlite_file(path.to_str().unwrap())).unwrap();
    relaxed
        .session(|s| {
            s.count(&Query::select("c", "Customer"))?;
            assert!(!s.in_transaction());
            Ok(())
        })
        .unwrap();
}

#[test]
fn drop_tables_removes_the_schema() {
    let db = Database::memory(shop()).unwrap();
    db.create_tables().unwrap();
    db.drop_tables().unwrap();
    let err = db
        .session(|s| s.count(&Query::select("c", "Customer")))
        .unwrap_err();
    assert!(matches!(err, Error::Query(_)));

    db.create_tables().unwrap();
    assert_eq!(db.session(|s| s.count(&Query::select("c", "Customer"))).unwrap(), 0);
}

#[test]
fn deleting_a_customer_cascades_to_orders() {
    let db = Database::memory(shop()).unwrap();
    db.create_tables().unwrap();
    db.session(|s| {
        let ann = s.create("Customer", vec![("name", "Ann".into())])?;
        s.create("Order", vec![("total", 5.into()), ("customer", (&ann).into())])?;
        Ok(())
    })
    .unwrap();

    let result = db
        .session(|s| {
            s.get("Customer", 1)?.delete()?;
            s.flush()
        })
        .unwrap();
    assert_eq!(result.deleted, 2);
    assert_eq!(db.session(|s| s.count(&Query::select("o", "Order"))).unwrap(), 0);
}

#[test]
fn unsupported_dialect_is_a_config_error() {
    let config = DatabaseConfig {
        dialect: corral::Dialect::Mysql,
        ..DatabaseConfig::default()
    };
    assert!(matches!(Database::open(shop(), config), Err(Error::Config(_))));
}
