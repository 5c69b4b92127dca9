//! Integration tests for many-to-many relationships.

mod common;

use common::{memory_db, schema, values};
use oxide_tables::prelude::*;

const LINKED: &str = r#"{
    "tables": [
        { "name": "x", "fields": [{ "name": "label" }],
          "default_records": [{ "label": "x1" }, { "label": "x2" }] },
        { "name": "y", "fields": [{ "name": "tag" }],
          "default_records": [{ "tag": "y1" }] }
    ],
    "relationships": [
        { "kind": "m:n", "policy": "link-all", "first_table": "x", "second_table": "y" }
    ]
}"#;

#[tokio::test]
async fn test_link_all_links_every_pair() {
    let db = memory_db().await;
    let report = db.migrate(&schema(LINKED)).await.unwrap();

    assert_eq!(report.relations, vec!["x_y"]);
    assert_eq!(report.linked, 2);
    assert_eq!(db.count("x_y", &Record::new()).await.unwrap(), 2);

    let linked = db
        .get_linked_records("y", &record! { "tag" => "y1" })
        .await
        .unwrap();
    assert_eq!(values(&linked["x"], "label"), vec!["x1", "x2"]);
}

#[tokio::test]
async fn test_link_all_only_fills_empty_join_tables() {
    let db = memory_db().await;
    db.migrate(&schema(LINKED)).await.unwrap();
    db.insert("x", &[record! { "label" => "x3" }]).await.unwrap();

    let report = db.migrate(&schema(LINKED)).await.unwrap();

    assert!(report.is_empty(), "unexpected changes: {report}");
    assert_eq!(db.count("x_y", &Record::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_rebuild_of_participant_keeps_links() {
    let db = memory_db().await;
    db.migrate(&schema(LINKED)).await.unwrap();
    db.unlink("x", &record! { "label" => "x2" }, "y", &record! { "tag" => "y1" })
        .await
        .unwrap();

    let grown = r#"{
        "tables": [
            { "name": "x", "fields": [{ "name": "label" }, { "name": "weight", "default": "0" }] },
            { "name": "y", "fields": [{ "name": "tag" }] }
        ],
        "relationships": [
            { "kind": "m:n", "policy": "link-all", "first_table": "x", "second_table": "y" }
        ]
    }"#;
    let report = db.migrate(&schema(grown)).await.unwrap();
    assert_eq!(report.rebuilt, vec!["x"]);
    assert_eq!(report.linked, 0);

    let linked = db
        .get_linked_records("y", &record! { "tag" => "y1" })
        .await
        .unwrap();
    assert_eq!(
        linked["x"],
        vec![record! { "label" => "x1", "weight" => "0" }]
    );
}

#[tokio::test]
async fn test_link_and_unlink_round_trip() {
    let db = memory_db().await;
    db.migrate(&schema(
        r#"{ "tables": [
            { "name": "books", "fields": [{ "name": "title" }] },
            { "name": "authors", "fields": [{ "name": "name" }] }
        ], "relationships": [ { "kind": "m:n", "first_table": "books", "second_table": "authors" } ] }"#,
    ))
    .await
    .unwrap();

    let book = record! { "title" => "Dune" };
    let author = record! { "name" => "Herbert" };

    assert_eq!(db.link("books", &book, "authors", &author).await.unwrap(), 1);
    assert_eq!(
        db.get_linked_records("authors", &author).await.unwrap()["books"],
        vec![book.clone()]
    );

    assert_eq!(db.unlink("authors", &author, "books", &book).await.unwrap(), 1);
    assert!(db.get_linked_records("books", &book).await.unwrap()["authors"].is_empty());
    // Unlinking does not delete the records themselves.
    assert_eq!(db.count("books", &Record::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_relation_creation_is_order_independent() {
    let db = memory_db().await;
    db.migrate(&schema(LINKED)).await.unwrap();

    let again = db
        .create_relation(RelationKind::ManyToMany, "y", "x")
        .await
        .unwrap();

    assert_eq!(again, "x_y");
    assert_eq!(db.join_tables().await.unwrap().len(), 1);
    assert!(!db.table_exists("y_x").await);
}

#[tokio::test]
async fn test_undeclared_relationship_is_dropped() {
    let db = memory_db().await;
    db.migrate(&schema(LINKED)).await.unwrap();

    let unrelated = r#"{ "tables": [
        { "name": "x", "fields": [{ "name": "label" }] },
        { "name": "y", "fields": [{ "name": "tag" }] }
    ] }"#;
    let report = db.migrate(&schema(unrelated)).await.unwrap();

    assert_eq!(report.dropped, vec!["x_y"]);
    assert_eq!(report.rebuilt, vec!["x", "y"]);
    assert!(db.join_tables().await.unwrap().is_empty());
    assert!(!db.materialize("x").await.referenced);
    assert_eq!(
        db.select("x", &[], false).await.unwrap(),
        vec![record! { "label" => "x1" }, record! { "label" => "x2" }]
    );
}

#[tokio::test]
async fn test_relating_a_live_table_adds_surrogate_keys() {
    let db = memory_db().await;
    db.migrate(&schema(
        r#"{ "tables": [
            { "name": "a", "fields": [{ "name": "v" }], "default_records": [{ "v": "1" }, { "v": "2" }] },
            { "name": "b", "fields": [{ "name": "w" }], "default_records": [{ "w": "z" }] }
        ] }"#,
    ))
    .await
    .unwrap();

    let join = db
        .create_relation(RelationKind::ManyToMany, "a", "b")
        .await
        .unwrap();
    let linked = db.apply_policy(&join, Policy::LinkAll, "a", "b").await.unwrap();

    assert_eq!(linked, 2);
    assert_eq!(
        values(&db.select("a", &["id"], false).await.unwrap(), "id"),
        vec!["1", "2"]
    );
}

#[tokio::test]
async fn test_self_relation_rejected() {
    let db = memory_db().await;
    db.migrate(&schema(LINKED)).await.unwrap();

    let result = db.create_relation(RelationKind::ManyToMany, "x", "x").await;
    assert!(matches!(result, Err(TablesError::SelfRelation(_))));
}
