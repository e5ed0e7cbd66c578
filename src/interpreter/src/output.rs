// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rendering of statement outcomes for the notebook display.

use hql_conn_pool::{BackendError, RowCursor};

/// Prefix that makes the notebook render a body as a table.
pub const TABLE_MARKER: &str = "%table ";
/// Header line of the body reported for statements without a result set.
pub const UPDATE_COUNT_HEADER: &str = "Update Count";

const EXPLAIN_PREDICATE: &str = "EXPLAIN ";
const TAB: char = '\t';
const NEWLINE: char = '\n';
const NULL: &str = "null";

/// Whether `sql` is a query plan request, whose output is not a table.
pub fn is_explain(sql: &str) -> bool {
    sql.to_ascii_uppercase().contains(EXPLAIN_PREDICATE)
}

/// Starts an output body for `sql`.
pub fn body_for(sql: &str) -> String {
    if is_explain(sql) {
        String::new()
    } else {
        TABLE_MARKER.to_string()
    }
}

/// Appends the column header and up to `max_rows` rows from `cursor` to
/// `body`.
///
/// Rows beyond `max_rows` are not read and leave no trace in the output.
pub async fn render_rows(
    body: &mut String,
    cursor: &mut dyn RowCursor,
    max_rows: usize,
) -> Result<(), BackendError> {
    push_line(body, cursor.columns().iter().map(String::as_str));
    let mut rendered = 0;
    while rendered < max_rows {
        let Some(row) = cursor.next_row().await? else {
            break;
        };
        push_line(body, row.iter().map(|cell| cell.as_deref().unwrap_or(NULL)));
        rendered += 1;
    }
    Ok(())
}

/// Appends the update count block to `body`.
pub fn render_update_count(body: &mut String, count: i64) {
    body.push_str(UPDATE_COUNT_HEADER);
    body.push(NEWLINE);
    body.push_str(&count.to_string());
    body.push(NEWLINE);
}

fn push_line<'a>(body: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            body.push(TAB);
        }
        body.push_str(cell);
    }
    body.push(NEWLINE);
}

#[cfg(test)]
mod tests {
    use hql_conn_pool::testing::{MockDriver, MockResponse};
    use hql_conn_pool::{Connection, Driver, ExecuteOutcome};
    use hql_datasource::{ConnectAuth, Properties};

    use super::*;

    #[test]
    fn explain_detection_ignores_case() {
        assert!(is_explain("EXPLAIN SELECT 1"));
        assert!(is_explain("explain select 1"));
        assert!(is_explain("  Explain Analyze SELECT 1"));
        assert!(!is_explain("SELECT 'explained'"));
        assert!(!is_explain("EXPLAIN"));
        assert_eq!(body_for("explain select 1"), "");
        assert_eq!(body_for("select 1"), "%table ");
    }

    #[test]
    fn update_count_block() {
        let mut body = body_for("DELETE FROM t");
        render_update_count(&mut body, 3);
        assert_eq!(body, "%table Update Count\n3\n");
    }

    async fn cursor_for(response: MockResponse) -> Box<dyn RowCursor> {
        let driver = MockDriver::new();
        driver.respond("q", response);
        let connection = driver
            .connect("mock://", &ConnectAuth::Properties(Properties::new()))
            .await
            .unwrap();
        let statement = connection.create_statement().await.unwrap();
        match statement.execute("q", 0).await.unwrap() {
            ExecuteOutcome::Rows(cursor) => cursor,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn renders_header_and_rows() {
        let mut cursor = cursor_for(MockResponse::Rows {
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                vec![Some("1".into()), Some("a".into())],
                vec![Some("2".into()), None],
            ],
        })
        .await;
        let mut body = body_for("SELECT id, name FROM t");
        render_rows(&mut body, &mut *cursor, 1000).await.unwrap();
        assert_eq!(body, "%table id\tname\n1\ta\n2\tnull\n");
    }

    #[tokio::test]
    async fn truncates_silently() {
        let mut cursor = cursor_for(MockResponse::rows(
            &["n"],
            &[&["1"], &["2"], &["3"], &["4"], &["5"]],
        ))
        .await;
        let mut body = String::new();
        render_rows(&mut body, &mut *cursor, 2).await.unwrap();
        assert_eq!(body, "n\n1\n2\n");
    }

    #[tokio::test]
    async fn zero_row_limit_renders_header_only() {
        let mut cursor = cursor_for(MockResponse::rows(&["n"], &[&["1"]])).await;
        let mut body = String::new();
        render_rows(&mut body, &mut *cursor, 0).await.unwrap();
        assert_eq!(body, "n\n");
    }
}
