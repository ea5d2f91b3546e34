use crate::*;

fn parent_match(parent: &str, key: &str) -> SelectStmt {
    SelectStmt::new()
        .column(SelectColumn::expr(Expr::int(1)))
        .from(FromClause::aliased(parent, "p"))
        .where_(Expr::qualified_column("p", key).eq(Expr::qualified_column("c", "uid_foreign")))
}

#[test]
fn test_anti_join_count() {
    let stmt = SelectStmt::new()
        .column(SelectColumn::aliased(Expr::CountStar, "orphans"))
        .from(FromClause::aliased("sys_file_reference", "c"))
        .where_(
            Expr::qualified_column("c", "tablenames")
                .cast("text")
                .eq(Expr::param("tablenames")),
        )
        .and_where(Expr::not_exists(parent_match("tt_content", "uid")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    SELECT COUNT(*) AS "orphans"
    FROM "sys_file_reference" "c"
    WHERE CAST("c"."tablenames" AS text) = $1 AND NOT EXISTS (SELECT 1
    FROM "tt_content" "p"
    WHERE "p"."uid" = "c"."uid_foreign")
    "#);
    assert_eq!(result.params, vec!["tablenames".to_string()]);
}

#[test]
fn test_anti_join_delete() {
    let stmt = DeleteStmt::new("sys_category_record_mm")
        .alias("c")
        .where_(
            Expr::qualified_column("c", "tablenames")
                .cast("text")
                .eq(Expr::param("tablenames")),
        )
        .and_where(
            Expr::qualified_column("c", "fieldname")
                .cast("text")
                .eq(Expr::param("fieldname")),
        )
        .and_where(Expr::not_exists(parent_match("pages", "uid")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    DELETE FROM "sys_category_record_mm" "c"
    WHERE CAST("c"."tablenames" AS text) = $1 AND CAST("c"."fieldname" AS text) = $2 AND NOT EXISTS (SELECT 1
    FROM "pages" "p"
    WHERE "p"."uid" = "c"."uid_foreign")
    "#);
    assert_eq!(
        result.params,
        vec!["tablenames".to_string(), "fieldname".to_string()]
    );
}

#[test]
fn test_select_distinct_ordered() {
    let stmt = SelectStmt::new()
        .distinct()
        .columns([
            SelectColumn::expr(Expr::column("tablenames").cast("text")),
            SelectColumn::expr(Expr::column("fieldname").cast("text")),
        ])
        .from(FromClause::table("sys_category_record_mm"));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    SELECT DISTINCT CAST("tablenames" AS text), CAST("fieldname" AS text)
    FROM "sys_category_record_mm"
    "#);
    assert!(result.params.is_empty());
}

#[test]
fn test_group_by_having() {
    let key = ["uid_local", "uid_foreign"];
    let stmt = SelectStmt::new()
        .columns(key.map(|c| SelectColumn::expr(Expr::column(c))))
        .from(FromClause::table("tx_gomapsext_map_address_mm"))
        .group_by(key.map(Expr::column))
        .having(Expr::CountStar.gt(Expr::int(1)))
        .order_by(OrderBy::asc(Expr::column("uid_local")))
        .order_by(OrderBy::asc(Expr::column("uid_foreign")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    SELECT "uid_local", "uid_foreign"
    FROM "tx_gomapsext_map_address_mm"
    GROUP BY "uid_local", "uid_foreign"
    HAVING COUNT(*) > 1
    ORDER BY "uid_local" ASC, "uid_foreign" ASC
    "#);
}

#[test]
fn test_select_storage_order_with_limit() {
    let stmt = SelectStmt::new()
        .column(SelectColumn::expr(Expr::column("uid_local").cast("text")))
        .from(FromClause::table("sys_category_record_mm"))
        .where_(Expr::column("uid_local").eq(Expr::param("uid_local").cast("bigint")))
        .and_where(Expr::column("fieldname").is_null())
        .order_by(OrderBy::asc(Expr::column("ctid")))
        .limit(Expr::int(10));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    SELECT CAST("uid_local" AS text)
    FROM "sys_category_record_mm"
    WHERE "uid_local" = CAST($1 AS bigint) AND "fieldname" IS NULL
    ORDER BY "ctid" ASC
    LIMIT 10
    "#);
}

#[test]
fn test_insert_with_casts() {
    let stmt = InsertStmt::new("sys_category_record_mm")
        .column("uid_local", Expr::param("uid_local").cast("integer"))
        .column("tablenames", Expr::param("tablenames").cast("character varying(255)"))
        .column("fieldname", Expr::Null);

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    INSERT INTO "sys_category_record_mm" ("uid_local", "tablenames", "fieldname")
    VALUES (CAST($1 AS integer), CAST($2 AS character varying(255)), NULL)
    "#);
    assert_eq!(
        result.params,
        vec!["uid_local".to_string(), "tablenames".to_string()]
    );
}

#[test]
fn test_update_copies_and_binds() {
    let stmt = UpdateStmt::new("tt_content")
        .set("assets", Expr::column("media").cast("text").cast("integer"))
        .set("media", Expr::param("zero").cast("text").cast("integer"))
        .where_(Expr::column("uid").cast("text").eq(Expr::param("uid")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    UPDATE "tt_content"
    SET "assets" = CAST(CAST("media" AS text) AS integer), "media" = CAST(CAST($1 AS text) AS integer)
    WHERE CAST("uid" AS text) = $2
    "#);
    assert_eq!(result.params, vec!["zero".to_string(), "uid".to_string()]);
}

#[test]
fn test_alter_column_type_with_collation() {
    let stmt = AlterTableStmt::alter_column_type(
        "pages",
        "title",
        "character varying(255)",
        Some("C".to_string()),
    );

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"ALTER TABLE "pages" ALTER COLUMN "title" TYPE character varying(255) COLLATE "C""#);
}

#[test]
fn test_alter_column_type_without_collation() {
    let stmt = AlterTableStmt::alter_column_type("pages", "bodytext", "text", None);

    let result = render(&stmt);
    assert_eq!(result.sql, r#"ALTER TABLE "pages" ALTER COLUMN "bodytext" TYPE text"#);
}

#[test]
fn test_param_reused_keeps_index() {
    let stmt = SelectStmt::new()
        .from(FromClause::table("t"))
        .where_(Expr::column("a").eq(Expr::param("x")))
        .and_where(Expr::column("b").eq(Expr::param("y")))
        .and_where(Expr::column("c").eq(Expr::param("x")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    SELECT *
    FROM "t"
    WHERE "a" = $1 AND "b" = $2 AND "c" = $1
    "#);
    assert_eq!(result.params, vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn test_hostile_identifiers_stay_quoted() {
    let stmt = DeleteStmt::new("x\"; DROP TABLE pages; --")
        .where_(Expr::column("name").eq(Expr::string("it's")));

    let result = render(&stmt);
    insta::assert_snapshot!(result.sql, @r#"
    DELETE FROM "x""; DROP TABLE pages; --"
    WHERE "name" = 'it''s'
    "#);
}

#[test]
fn test_expr_all() {
    assert_eq!(Expr::all(Vec::<Expr>::new()), None);
    let combined = Expr::all([
        Expr::column("a").is_not_null(),
        Expr::column("b").eq(Expr::column_of(Some("c"), "d")),
    ]);
    let stmt = SelectStmt::new()
        .from(FromClause::table("t"))
        .where_(combined.unwrap());
    assert_eq!(
        render(&stmt).sql,
        "SELECT *\nFROM \"t\"\nWHERE \"a\" IS NOT NULL AND \"b\" = \"c\".\"d\""
    );
}
