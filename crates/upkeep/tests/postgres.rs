//! Integration tests against real PostgreSQL.
//!
//! Run with: cargo test -p upkeep --features test-postgres --test postgres
//!
//! Uses the server at POSTGRES_HOST/POSTGRES_PORT (user and password
//! `postgres`) when set, otherwise starts a container, which needs Docker.

#![cfg(feature = "test-postgres")]

use std::time::Duration;

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};
use upkeep::unit::TracingProgress;
use upkeep::{
    CollationNormalizer, CollationTarget, Database, DuplicateCollapser, DuplicateKey, Error,
    Introspector, OrphanFinder, PgDatabase, RelationDescriptor, StringKind, UpgradeUnit, Value,
};

struct TestDb {
    db: PgDatabase<Client>,
    _container: Option<ContainerAsync<Postgres>>,
}

async fn connect(conn_str: &str) -> Client {
    let mut attempts = 0;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(conn_str, NoTls).await {
            Ok(result) => break result,
            Err(e) if attempts < 10 => {
                tracing::debug!("connection attempt {attempts} failed: {e}, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => panic!("failed to connect to postgres after {attempts} attempts: {e}"),
        }
    };
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// A fresh schema per test, so tests can share one server.
async fn setup(schema: &str, ddl: &str) -> TestDb {
    let (conn_str, container) = match (
        std::env::var("POSTGRES_HOST"),
        std::env::var("POSTGRES_PORT"),
    ) {
        (Ok(host), Ok(port)) => (
            format!("host={host} port={port} user=postgres password=postgres"),
            None,
        ),
        _ => {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("postgres port not mapped");
            (
                format!("host=127.0.0.1 port={port} user=postgres password=postgres"),
                Some(container),
            )
        }
    };

    let client = connect(&conn_str).await;
    client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema}; SET search_path TO {schema};"
        ))
        .await
        .expect("failed to create schema");
    client.batch_execute(ddl).await.expect("failed to create tables");

    TestDb {
        db: PgDatabase::new(client),
        _container: container,
    }
}

async fn uids(db: &PgDatabase<Client>, table: &str) -> Vec<Value> {
    db.select_rows(table, &upkeep::Filter::all())
        .await
        .unwrap()
        .into_iter()
        .map(|row| row["uid"].clone())
        .collect()
}

#[tokio::test]
async fn introspection_reports_absence() {
    let t = setup(
        "introspect",
        "CREATE TABLE pages (uid integer, title varchar(255), bodytext text, flag char(1));",
    )
    .await;

    assert_eq!(t.db.tables().await.unwrap(), ["pages"]);
    assert!(t.db.table_exists("pages").await.unwrap());
    assert!(!t.db.table_exists("tx_gone").await.unwrap());
    assert!(t.db.column_exists("pages", "title").await.unwrap());
    assert!(!t.db.column_exists("pages", "nope").await.unwrap());
    assert!(!t.db.column_exists("tx_gone", "uid").await.unwrap());
    assert!(t.db.columns("tx_gone").await.unwrap().is_empty());
    assert_eq!(t.db.table_collation("pages").await.unwrap(), None);

    let strings = t.db.string_columns("pages").await.unwrap();
    let kinds: Vec<_> = strings
        .iter()
        .map(|c| (c.name.as_str(), c.column_type.as_string().map(|s| s.kind)))
        .collect();
    assert_eq!(
        kinds,
        [
            ("title", Some(StringKind::Short)),
            ("bodytext", Some(StringKind::Long)),
            ("flag", Some(StringKind::Short)),
        ]
    );
    assert_eq!(
        t.db.column_collation("pages", "title").await.unwrap().as_deref(),
        Some("default")
    );
    assert_eq!(t.db.column_collation("pages", "uid").await.unwrap(), None);
}

#[tokio::test]
async fn polymorphic_orphans_are_removed() {
    let t = setup(
        "orphans",
        "CREATE TABLE pages (uid integer, categories integer);
         CREATE TABLE sys_category (uid integer);
         CREATE TABLE sys_category_record_mm (
             uid integer, uid_local integer, uid_foreign integer,
             tablenames varchar(255), fieldname varchar(255));
         INSERT INTO pages (uid) VALUES (10);
         INSERT INTO sys_category (uid) VALUES (1);
         INSERT INTO sys_category_record_mm VALUES
             (1, 1, 10, 'pages', 'categories'),
             (2, 1, 99, 'pages', 'categories'),
             (3, 1, 10, 'tx_gone', 'categories'),
             (4, 1, 10, 'pages', 'removed_field'),
             (5, 2, 10, 'pages', 'categories'),
             (6, 1, 10, '', '');",
    )
    .await;

    let unit = upkeep::units::OrphanedRowsUnit::sys_category_record_mm();
    assert!(unit.necessary(&t.db).await.unwrap());

    let report = unit.finder().scan(&t.db).await.unwrap();
    assert_eq!(report.total(), 4);

    unit.apply(&t.db, &TracingProgress).await.unwrap();
    assert_eq!(
        uids(&t.db, "sys_category_record_mm").await,
        [Value::from("1"), Value::from("6")]
    );
    assert!(!unit.necessary(&t.db).await.unwrap());
}

#[tokio::test]
async fn static_orphans_are_removed() {
    let t = setup(
        "static_orphans",
        "CREATE TABLE sys_file (uid integer);
         CREATE TABLE sys_file_metadata (uid integer, file integer);
         INSERT INTO sys_file VALUES (10);
         INSERT INTO sys_file_metadata VALUES (1, 10), (2, 99), (3, NULL);",
    )
    .await;

    let finder = OrphanFinder::new(vec![RelationDescriptor::fixed(
        "sys_file_metadata",
        "file",
        "sys_file",
        "uid",
    )]);
    assert_eq!(finder.apply(&t.db).await.unwrap(), 2);
    assert_eq!(uids(&t.db, "sys_file_metadata").await, [Value::from("1")]);
}

#[tokio::test]
async fn duplicates_collapse_to_the_first_row() {
    let t = setup(
        "duplicates",
        "CREATE TABLE sys_category_record_mm (
             uid_local integer, uid_foreign integer,
             tablenames varchar(255), fieldname varchar(255),
             sorting integer, created timestamptz DEFAULT now());
         INSERT INTO sys_category_record_mm (uid_local, uid_foreign, tablenames, fieldname, sorting) VALUES
             (5, 7, 'pages', 'categories', 3),
             (5, 7, 'pages', 'categories', 1),
             (5, 7, 'pages', 'categories', 2),
             (6, 7, 'pages', NULL, 0),
             (6, 7, 'pages', NULL, 4);",
    )
    .await;

    let key = DuplicateKey::new(["uid_local", "uid_foreign", "tablenames", "fieldname"]).unwrap();
    let collapser = DuplicateCollapser::new("sys_category_record_mm", key);

    assert_eq!(collapser.groups(&t.db).await.unwrap().len(), 2);
    assert_eq!(collapser.apply(&t.db).await.unwrap(), 2);

    let rows = t
        .db
        .select_rows("sys_category_record_mm", &upkeep::Filter::all())
        .await
        .unwrap();
    let sortings: Vec<_> = rows.iter().map(|r| r["sorting"].clone()).collect();
    assert_eq!(sortings.len(), 2);
    assert!(sortings.contains(&Value::from("3")));
    assert!(sortings.contains(&Value::from("0")));
    assert!(rows.iter().all(|r| !r["created"].is_null()));
    assert!(!collapser.necessary(&t.db).await.unwrap());
}

#[tokio::test]
async fn failed_reinsert_is_rolled_back() {
    let t = setup(
        "partial_write",
        "CREATE TABLE mm (uid_local integer, uid_foreign integer, note varchar(10));
         CREATE FUNCTION refuse() RETURNS trigger AS $$
         BEGIN RAISE EXCEPTION 'no inserts'; END $$ LANGUAGE plpgsql;
         INSERT INTO mm VALUES (1, 2, 'a'), (1, 2, 'b');
         CREATE TRIGGER refuse BEFORE INSERT ON mm FOR EACH ROW EXECUTE FUNCTION refuse();",
    )
    .await;

    let collapser = DuplicateCollapser::new("mm", DuplicateKey::new(["uid_local", "uid_foreign"]).unwrap());
    let err = collapser.apply(&t.db).await.unwrap_err();
    assert!(matches!(err, Error::PartialWrite { .. }), "{err}");
    assert_eq!(
        t.db.count("mm", &upkeep::Filter::all()).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn columns_converge_on_target_collation() {
    let t = setup(
        "collation",
        "CREATE TABLE tt_content (uid integer, header varchar(255), bodytext text);",
    )
    .await;
    let normalizer = CollationNormalizer::new(CollationTarget::new("UTF8", "C"));

    assert!(normalizer.necessary(&t.db).await.unwrap());
    let report = normalizer.apply(&t.db).await.unwrap();
    assert_eq!((report.tables, report.columns), (0, 2));

    for column in t.db.string_columns("tt_content").await.unwrap() {
        assert_eq!(column.collation.as_deref(), Some("C"));
    }
    let header = &t.db.columns("tt_content").await.unwrap()[1];
    assert_eq!(header.column_type.to_string(), "character varying(255)");
    assert!(!normalizer.necessary(&t.db).await.unwrap());
}

#[tokio::test]
async fn unknown_collation_is_a_config_error() {
    let t = setup(
        "collation_unknown",
        "CREATE TABLE tt_content (uid integer, header varchar(255));",
    )
    .await;
    let normalizer =
        CollationNormalizer::new(CollationTarget::new("utf8mb4", "utf8mb4_general_ci"));

    assert!(matches!(normalizer.necessary(&t.db).await, Err(Error::Config(_))));
    assert!(matches!(normalizer.apply(&t.db).await, Err(Error::Config(_))));
    assert_eq!(
        t.db.column_collation("tt_content", "header").await.unwrap().as_deref(),
        Some("default")
    );
}

#[tokio::test]
async fn integer_filters_match_text_columns() {
    let t = setup(
        "int_filters",
        "CREATE TABLE refs (uid integer, ref varchar(32));
         INSERT INTO refs VALUES (1, '5'), (2, '6'), (3, NULL);",
    )
    .await;

    assert_eq!(t.db.count("refs", &upkeep::Filter::all().eq("ref", 5)).await.unwrap(), 1);
    assert_eq!(t.db.count("refs", &upkeep::Filter::all().eq("uid", "2")).await.unwrap(), 1);
    assert_eq!(
        t.db.count("refs", &upkeep::Filter::all().eq("ref", Value::Null)).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn textmedia_references_move_to_assets() {
    let t = setup(
        "textmedia",
        "CREATE TABLE tt_content (uid integer, \"CType\" varchar(255), media integer, assets integer);
         CREATE TABLE sys_file_reference (
             uid integer, uid_foreign integer, tablenames varchar(64), fieldname varchar(64));
         INSERT INTO tt_content VALUES (1, 'textmedia', 2, 0), (2, 'image', 1, 0);
         INSERT INTO sys_file_reference VALUES
             (1, 1, 'tt_content', 'media'),
             (2, 1, 'tt_content', 'media'),
             (3, 2, 'tt_content', 'media');",
    )
    .await;
    let unit = upkeep::units::TextMediaAssetsUnit;

    assert!(unit.necessary(&t.db).await.unwrap());
    unit.apply(&t.db, &TracingProgress).await.unwrap();

    let moved = upkeep::Filter::all().eq("fieldname", "assets");
    assert_eq!(t.db.count("sys_file_reference", &moved).await.unwrap(), 2);
    let content = t
        .db
        .select_rows("tt_content", &upkeep::Filter::all().eq("uid", 1))
        .await
        .unwrap();
    assert_eq!(
        (&content[0]["media"], &content[0]["assets"]),
        (&Value::from("0"), &Value::from("2"))
    );
    assert!(!unit.necessary(&t.db).await.unwrap());
}
