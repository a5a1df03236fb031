use serde_json::{Map, Number, Value};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteRow},
    Column, Row, Sqlite, TypeInfo, ValueRef,
};

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Quotes an SQL identifier.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name.
pub(crate) fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

/// A conjunction of column conditions together with its parameters, kept in
/// placeholder order.
#[derive(Debug, Default, Clone)]
pub(crate) struct Conditions {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Conditions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, alias: Option<&str>, column: &str, value: &Value) {
        let target = match alias {
            Some(alias) => format!("{alias}.{}", quote(column)),
            None => quote(column),
        };

        match value {
            Value::Null => self.clauses.push(format!("{target} IS NULL")),
            Value::Array(items) if items.is_empty() => self.clauses.push("0 = 1".to_string()),
            Value::Array(items) => {
                let placeholders = vec!["?"; items.len()].join(", ");
                self.clauses.push(format!("{target} IN ({placeholders})"));
                self.params.extend(items.iter().cloned());
            }
            other => {
                self.clauses.push(format!("{target} = ?"));
                self.params.push(other.clone());
            }
        }
    }

    pub(crate) fn push_all(&mut self, alias: Option<&str>, conditions: &Map<String, Value>) {
        for (column, value) in conditions {
            self.push(alias, column, value);
        }
    }

    pub(crate) fn sql(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }

    pub(crate) fn bind<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        self.params.iter().fold(query, bind)
    }
}

/// Binds a JSON value as the closest SQLite type.
pub(crate) fn bind<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => query.bind(integer),
            None => query.bind(number.as_f64()),
        },
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decodes every column of a row into a JSON map keyed by column name.
///
/// Blobs are base64 encoded.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut columns = Map::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" | "NUMERIC" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(base64::encode(
                    row.try_get_unchecked::<Vec<u8>, _>(index)?,
                )),
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };

        columns.insert(column.name().to_string(), value);
    }

    Ok(columns)
}

/// Perl-style truthiness, used for role maps such as `{"admin": 1}`.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map_or(true, |n| n != 0.0),
        Value::String(text) => !text.is_empty() && text != "0",
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("user"), "\"user\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("main", "user"), "\"main\".\"user\"");
    }

    #[test]
    fn test_conditions_sql() {
        let mut conditions = Conditions::new();
        assert_eq!(conditions.sql(), "1 = 1");

        conditions.push(Some("u"), "username", &json!("ferris"));
        conditions.push_all(
            Some("u"),
            json!({ "deleted_at": null, "status": ["active", "pending"] })
                .as_object()
                .unwrap(),
        );

        assert_eq!(
            conditions.sql(),
            "u.\"username\" = ? AND u.\"deleted_at\" IS NULL AND u.\"status\" IN (?, ?)"
        );
        assert_eq!(
            conditions.params,
            vec![json!("ferris"), json!("active"), json!("pending")]
        );
    }

    #[test]
    fn test_empty_in_list_matches_nothing() {
        let mut conditions = Conditions::new();
        conditions.push(None, "status", &json!([]));
        assert_eq!(conditions.sql(), "0 = 1");
        assert!(conditions.params.is_empty());
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("0")));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
    }

    #[tokio::test]
    async fn test_decode_and_bind() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query("CREATE TABLE things (i INTEGER, r REAL, t TEXT, b BLOB, n TEXT)")
            .execute(&pool)
            .await
            .unwrap();

        let values = [json!(7), json!(1.5), json!("seven"), Value::Null];
        let insert = values.iter().fold(
            sqlx::query("INSERT INTO things VALUES (?, ?, ?, x'0102', ?)"),
            bind,
        );
        insert.execute(&pool).await.unwrap();

        let row = sqlx::query("SELECT * FROM things")
            .fetch_one(&pool)
            .await
            .unwrap();
        let columns = decode_row(&row).unwrap();

        assert_eq!(columns["i"], json!(7));
        assert_eq!(columns["r"], json!(1.5));
        assert_eq!(columns["t"], json!("seven"));
        assert_eq!(columns["b"], json!(base64::encode([1u8, 2])));
        assert_eq!(columns["n"], Value::Null);
    }
}
