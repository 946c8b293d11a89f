use std::sync::Arc;

use corral_bridge::{
    AttrChange, Change, Mutation, ObjRef, Permission, PermissionContext, Permissions, RemoteCache,
    Rule, SerializeOptions, UpdatePacket, describe, deserialize, serialize,
};
use corral_core::{Attribute, EntityDef, Error, Schema, SqlType, Value};
use corral_schema::create_all;
use corral_session::Session;
use corral_sqlite::SqliteConnection;
use indexmap::IndexMap;
use serde_json::json;

fn club() -> Schema {
    Schema::builder()
        .entity(
            EntityDef::new("Person")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("name", SqlType::Text))
                .attr(Attribute::optional("age", SqlType::Integer))
                .attr(Attribute::optional("password", SqlType::Text))
                .attr(Attribute::optional("secret", SqlType::Text).hidden())
                .attr(Attribute::set("cars", "Car")),
        )
        .entity(
            EntityDef::new("Car")
                .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                .attr(Attribute::required("make", SqlType::Text))
                .attr(Attribute::required_ref("owner", "Person")),
        )
        .build()
        .unwrap()
}

/// A session holding Ann (30) with one car, committed.
fn seeded() -> Session {
    let schema = Arc::new(club());
    let conn = SqliteConnection::open_memory().unwrap();
    create_all(&conn, &schema).unwrap();
    let s = Session::new(schema, Box::new(conn));
    let ann = s
        .create(
            "Person",
            vec![
                ("name", "Ann".into()),
                ("age", 30.into()),
                ("password", "hunter2".into()),
                ("secret", "x".into()),
            ],
        )
        .unwrap();
    s.create("Car", vec![("make", "Volvo".into()), ("owner", (&ann).into())])
        .unwrap();
    s.commit().unwrap();
    s
}

fn no_observer(_: &Mutation) -> corral_core::Result<()> {
    Ok(())
}

#[test]
fn round_trip_without_edits_applies_nothing() {
    let s = seeded();
    let ann = s.get("Person", 1).unwrap();
    let options = SerializeOptions::new().include(["Person.cars"]);
    let packet = serialize(&s, &[ann], &options, None).unwrap();

    assert_eq!(packet.data, vec!["t1"]);
    let person = &packet.objects["t1"];
    assert_eq!(person["name"], json!("Ann"));
    assert_eq!(person["cars"], json!(["t2"]));
    assert_eq!(packet.objects["t2"]["make"], json!("Volvo"));
    assert_eq!(packet.objects["t2"]["owner"], json!("t1"));
    assert!(packet.schema.is_some());

    let cache = RemoteCache::from_packet(packet).unwrap();
    let update = cache.changes();
    assert!(update.is_empty());

    let mut seen = 0;
    let applied = deserialize(&s, &update, None, |_| {
        seen += 1;
        Ok(())
    })
    .unwrap();
    assert!(applied.mutations.is_empty());
    assert!(applied.keys.is_empty());
    assert_eq!(seen, 0);
}

#[test]
fn one_modified_field_is_one_update() {
    let s = seeded();
    let ann = s.get("Person", 1).unwrap();
    let packet = serialize(&s, &[ann], &SerializeOptions::new(), None).unwrap();
    let mut cache = RemoteCache::from_packet(packet).unwrap();
    let tid = cache.roots()[0].clone();
    cache.set(&tid, "age", json!(31)).unwrap();

    let mut seen = Vec::new();
    let applied = deserialize(&s, &cache.changes(), None, |m| {
        if let Mutation::Update { attr, old, new, .. } = m {
            seen.push((attr.clone(), old.clone(), new.clone()));
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(applied.mutations.len(), 1);
    assert_eq!(applied.mutations[0].action(), "update");
    assert_eq!(seen, vec![("age".to_string(), json!(30), json!(31))]);
    s.commit().unwrap();

    let ann = s.get("Person", 1).unwrap();
    assert_eq!(ann.get("age").unwrap(), Value::Int(31));
}

#[test]
fn observer_error_aborts_the_update() {
    let s = seeded();
    let update = UpdatePacket {
        schema_hash: None,
        changes: vec![Change::Delete {
            target: ObjRef::stored("Car", json!(1)),
        }],
        payload: json!(null),
    };
    let err = deserialize(&s, &update, None, |m| match m {
        Mutation::Delete { .. } => Err(Error::Custom("cars are forever".into())),
        _ => Ok(()),
    })
    .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));
    assert_eq!(s.get("Car", 1).unwrap().get("make").unwrap(), Value::from("Volvo"));
}

#[test]
fn excluded_attribute_stays_hidden_despite_broader_rule() {
    let s = seeded();
    let permissions = Arc::new(
        Permissions::new()
            .rule(Rule::new([Permission::View], ["Person", "Car"]).exclude(["password"]))
            .rule(Rule::new([Permission::View, Permission::Edit], ["Person"]).group("staff")),
    );
    permissions.validate(s.schema()).unwrap();
    let staff = PermissionContext::new(permissions).groups(["staff"]);

    let ann = s.get("Person", 1).unwrap();
    let packet = serialize(&s, &[ann.clone()], &SerializeOptions::new(), Some(&staff)).unwrap();
    let person = &packet.objects["t1"];
    assert_eq!(person["name"], json!("Ann"));
    assert!(!person.contains_key("password"));
    assert!(!person.contains_key("secret"));

    let options = SerializeOptions::new().include(["Person.password"]);
    let err = serialize(&s, &[ann], &options, Some(&staff)).unwrap_err();
    assert!(matches!(err, Error::Permission(ref e) if e.attr.as_deref() == Some("password")));
}

#[test]
fn hidden_attribute_is_blocked_without_rules() {
    let s = seeded();
    let ann = s.get("Person", 1).unwrap();
    let packet = serialize(&s, &[ann.clone()], &SerializeOptions::new(), None).unwrap();
    assert!(!packet.objects["t1"].contains_key("secret"));
    assert_eq!(packet.objects["t1"]["password"], json!("hunter2"));

    let options = SerializeOptions::new().include(["Person.secret"]);
    assert!(matches!(
        serialize(&s, &[ann], &options, None),
        Err(Error::Permission(_))
    ));
}

#[test]
fn unknown_names_are_rejected() {
    let s = seeded();
    let ann = s.get("Person", 1).unwrap();
    for name in ["Person.nickname", "Robot.name", "name"] {
        let options = SerializeOptions::new().exclude([name]);
        assert!(matches!(
            serialize(&s, &[ann.clone()], &options, None),
            Err(Error::MalformedQuery(_))
        ));
    }
}

#[test]
fn known_schema_is_not_resent() {
    let s = seeded();
    let hash = describe(s.schema()).hash();
    let ann = s.get("Person", 1).unwrap();
    let options = SerializeOptions::new().known_schema_hash(hash);
    let packet = serialize(&s, &[ann], &options, None).unwrap();
    assert!(packet.schema.is_none());
    assert!(packet.schema_hash.is_none());
}

#[test]
fn stale_old_value_is_a_conflict() {
    let s = seeded();
    let update = UpdatePacket {
        schema_hash: None,
        changes: vec![Change::Update {
            target: ObjRef::stored("Person", json!(1)),
            values: IndexMap::from([(
                "age".to_string(),
                AttrChange {
                    old: json!(29),
                    new: json!(31),
                },
            )]),
        }],
        payload: json!(null),
    };
    let err = deserialize(&s, &update, None, no_observer).unwrap_err();
    assert!(matches!(err, Error::Conflict(ref e) if e.attrs == vec!["age".to_string()]));
}

#[test]
fn edit_without_permission_is_refused() {
    let s = seeded();
    let permissions = Arc::new(Permissions::new().rule(Rule::new([Permission::View], ["Person"])));
    let guest = PermissionContext::new(permissions);
    let update = UpdatePacket {
        schema_hash: None,
        changes: vec![Change::Update {
            target: ObjRef::stored("Person", json!(1)),
            values: IndexMap::from([(
                "name".to_string(),
                AttrChange {
                    old: json!("Ann"),
                    new: json!("Eve"),
                },
            )]),
        }],
        payload: json!(null),
    };
    let err = deserialize(&s, &update, Some(&guest), no_observer).unwrap_err();
    assert!(matches!(err, Error::Permission(ref e) if e.operation == "edit"));
}

#[test]
fn created_objects_get_keys_back() {
    let s = seeded();
    let ann = s.get("Person", 1).unwrap();
    let packet = serialize(&s, &[ann], &SerializeOptions::new(), None).unwrap();
    let mut cache = RemoteCache::from_packet(packet).unwrap();
    let owner = cache.roots()[0].clone();
    let bob = cache
        .create(
            "Person",
            [("name".to_string(), json!("Bob")), ("age".to_string(), json!(22))],
        )
        .unwrap();
    let car = cache
        .create(
            "Car",
            [("make".to_string(), json!("Fiat")), ("owner".to_string(), json!(bob))],
        )
        .unwrap();
    cache.add(&owner, "cars", &car).unwrap();

    let update = cache.changes();
    assert_eq!(update.schema_hash.as_deref(), Some(describe(s.schema()).hash().as_str()));
    let applied = deserialize(&s, &update, None, no_observer).unwrap();
    let actions: Vec<_> = applied.mutations.iter().map(Mutation::action).collect();
    assert_eq!(actions, vec!["create", "create", "add"]);
    assert_eq!(applied.keys[&bob], json!(2));
    assert_eq!(applied.keys[&car], json!(2));
    s.commit().unwrap();

    cache.apply_response(&applied.response()).unwrap();
    assert!(cache.changes().is_empty());
    assert_eq!(cache.find("Person", &json!(2)), Some(bob.as_str()));

    let car = s.get("Car", 2).unwrap();
    let owner = car.get_ref("owner").unwrap().unwrap();
    assert_eq!(owner.get("name").unwrap(), Value::from("Ann"));
}

#[test]
fn schema_mismatch_is_rejected() {
    let s = seeded();
    let update = UpdatePacket {
        schema_hash: Some("0".repeat(64)),
        changes: Vec::new(),
        payload: json!(null),
    };
    assert!(matches!(
        deserialize(&s, &update, None, no_observer),
        Err(Error::MalformedQuery(_))
    ));
}

#[test]
fn refused_attribute_leaves_the_session_untouched() {
    let s = seeded();
    let permissions = Arc::new(
        Permissions::new()
            .rule(Rule::new([Permission::View, Permission::Edit], ["Person"]).exclude(["name"])),
    );
    let staff = PermissionContext::new(permissions);
    let update = UpdatePacket {
        schema_hash: None,
        changes: vec![Change::Update {
            target: ObjRef::stored("Person", json!(1)),
            values: IndexMap::from([
                (
                    "age".to_string(),
                    AttrChange {
                        old: json!(30),
                        new: json!(99),
                    },
                ),
                (
                    "name".to_string(),
                    AttrChange {
                        old: json!("Ann"),
                        new: json!("Eve"),
                    },
                ),
            ]),
        }],
        payload: json!(null),
    };
    let err = deserialize(&s, &update, Some(&staff), no_observer).unwrap_err();
    assert!(matches!(err, Error::Permission(ref e) if e.attr.as_deref() == Some("name")));
    assert!(!s.has_changes());

    s.commit().unwrap();
    let ann = s.get("Person", 1).unwrap();
    assert_eq!(ann.get("age").unwrap(), Value::Int(30));
    assert_eq!(ann.get("name").unwrap(), Value::from("Ann"));
}

#[test]
fn failed_update_undoes_rows_written_during_the_call() {
    let s = seeded();
    s.get("Person", 1).unwrap().set("age", 31).unwrap();
    s.flush().unwrap();
    assert!(s.in_transaction());

    let mut values = IndexMap::new();
    values.insert("name".to_string(), json!("Bob"));
    let update = UpdatePacket {
        schema_hash: None,
        changes: vec![
            Change::Create {
                tid: "n1".into(),
                entity: "Person".into(),
                values,
            },
            Change::Delete {
                target: ObjRef::stored("Car", json!(1)),
            },
        ],
        payload: json!(null),
    };
    // the observer writes each new object at once and refuses deletions
    let err = deserialize(&s, &update, None, |m| match m {
        Mutation::Create { .. } => s.flush().map(|_| ()),
        Mutation::Delete { .. } => Err(Error::Custom("cars are forever".into())),
        _ => Ok(()),
    })
    .unwrap_err();
    assert!(matches!(err, Error::Custom(_)));
    assert!(!s.has_changes());
    assert!(s.in_transaction());

    s.commit().unwrap();
    assert_eq!(s.get("Person", 1).unwrap().get("age").unwrap(), Value::Int(31));
    assert!(s.get_by("Person", &[("name", Value::from("Bob"))]).unwrap().is_none());
    assert_eq!(s.get("Car", 1).unwrap().get("make").unwrap(), Value::from("Volvo"));
}
