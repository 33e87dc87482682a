use {
    crate::{
        Criteria,
        Record,
        ShardError,
        ShardResult,
        pool::RECORDS_TABLE,
        record::{from_sql, to_sql},
    },
    rusqlite::{Connection, ErrorCode, params_from_iter},
    serde_json::Value,
    std::{collections::BTreeSet, fmt},
};

/// Parameterized SQL statement against the records table.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    /// Creates a statement from raw SQL and positional parameters.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// `SELECT * FROM records WHERE k1 = ? AND ...`
    ///
    /// Empty criteria select every record.
    pub fn select(criteria: &Criteria) -> ShardResult<Self> {
        let mut sql = format!("SELECT * FROM {RECORDS_TABLE}");
        let (clause, params) = where_clause(criteria, &sql)?;
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        Ok(Self { sql, params })
    }

    /// `INSERT INTO records (k1, ...) VALUES (?, ...)`
    pub fn insert(record: &Record) -> ShardResult<Self> {
        let sql = format!("INSERT INTO {RECORDS_TABLE}");
        if record.is_empty() {
            return Err(syntax_error(&sql, "cannot insert an empty record"));
        }
        let columns = record
            .keys()
            .map(|key| identifier(key, &sql))
            .collect::<ShardResult<Vec<_>>>()?;
        let placeholders = vec!["?"; columns.len()].join(", ");

        Ok(Self {
            sql: format!("{sql} ({}) VALUES ({placeholders})", columns.join(", ")),
            params: record.values().cloned().collect(),
        })
    }

    /// `UPDATE records SET k1 = ?, ... WHERE c1 = ? AND ...`
    ///
    /// Criteria must not be empty, an unconstrained update is rejected.
    pub fn update(criteria: &Criteria, data: &Record) -> ShardResult<Self> {
        let sql = format!("UPDATE {RECORDS_TABLE}");
        if data.is_empty() {
            return Err(syntax_error(&sql, "nothing to update"));
        }
        let assignments = data
            .keys()
            .map(|key| Ok(format!("{} = ?", identifier(key, &sql)?)))
            .collect::<ShardResult<Vec<_>>>()?;
        let (clause, criteria_params) = where_clause(criteria, &sql)?;
        if clause.is_empty() {
            return Err(syntax_error(&sql, "update requires criteria"));
        }

        let mut params: Vec<Value> = data.values().cloned().collect();
        params.extend(criteria_params);
        Ok(Self {
            sql: format!("{sql} SET {} WHERE {clause}", assignments.join(", ")),
            params,
        })
    }

    /// `DELETE FROM records WHERE c1 = ? AND ...`
    ///
    /// Criteria must not be empty, an unconstrained delete is rejected.
    pub fn delete(criteria: &Criteria) -> ShardResult<Self> {
        let sql = format!("DELETE FROM {RECORDS_TABLE}");
        let (clause, params) = where_clause(criteria, &sql)?;
        if clause.is_empty() {
            return Err(syntax_error(&sql, "delete requires criteria"));
        }
        Ok(Self {
            sql: format!("{sql} WHERE {clause}"),
            params,
        })
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Result of running one statement on one shard.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Rows returned by a query. NULL columns are left out of each record.
    Rows(Vec<Record>),

    /// Number of rows changed by a write.
    Affected(usize),
}

/// Runs a statement on a connection.
///
/// Statements that produce columns are run as queries, everything else as
/// writes. SQLite autocommits each statement.
pub(crate) fn run(connection: &Connection, statement: &Statement) -> rusqlite::Result<Output> {
    let params = statement
        .params
        .iter()
        .map(to_sql)
        .collect::<ShardResult<Vec<_>>>()
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;

    let mut prepared = connection.prepare(&statement.sql)?;
    if prepared.column_count() == 0 {
        let affected = prepared.execute(params_from_iter(params))?;
        return Ok(Output::Affected(affected));
    }

    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = prepared.query(params_from_iter(params))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = from_sql(row.get_ref(idx)?);
            if !value.is_null() {
                record.insert(column.clone(), value);
            }
        }
        records.push(record);
    }
    Ok(Output::Rows(records))
}

/// Adds the given columns to the records table unless they already exist.
///
/// Every column is typeless, SQLite keeps the storage class of each value.
pub(crate) fn ensure_columns<'a, I>(connection: &Connection, columns: I) -> rusqlite::Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let columns: Vec<&str> = columns.into_iter().collect();
    if columns.is_empty() {
        return Ok(());
    }

    let mut existing = table_columns(connection)?;
    for column in columns {
        if identifier(column, RECORDS_TABLE).is_err() {
            return Err(rusqlite::Error::InvalidColumnName(column.to_string()));
        }
        if !existing.insert(column.to_ascii_lowercase()) {
            continue;
        }
        match connection.execute_batch(&format!("ALTER TABLE {RECORDS_TABLE} ADD COLUMN {column}")) {
            Ok(()) => {}
            // Added concurrently through another connection.
            Err(err) if err.to_string().contains("duplicate column name") => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn table_columns(connection: &Connection) -> rusqlite::Result<BTreeSet<String>> {
    let mut prepared = connection.prepare(&format!("PRAGMA table_info({RECORDS_TABLE})"))?;
    let columns = prepared
        .query_map([], |row| row.get::<_, String>(1))?
        .map(|name| name.map(|name| name.to_ascii_lowercase()))
        .collect();
    columns
}

/// Whether the error is worth retrying on the same connection.
pub(crate) fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Whether the connection that produced the error should be replaced.
pub(crate) fn is_broken(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
        )
    )
}

/// Whether the error stems from the statement itself rather than the data.
pub(crate) fn is_syntax(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::ToSqlConversionFailure(_) => true,
        _ => err.sqlite_error_code() == Some(ErrorCode::Unknown),
    }
}

/// Validates a column name.
///
/// Only ASCII letters, digits and underscores are allowed, and the name must
/// not start with a digit. Names are spliced into SQL text, so anything else
/// is rejected.
pub(crate) fn identifier<'a>(name: &'a str, statement: &str) -> ShardResult<&'a str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(syntax_error(statement, format!("invalid column name {name:?}")))
    }
}

fn where_clause(criteria: &Criteria, statement: &str) -> ShardResult<(String, Vec<Value>)> {
    let conditions = criteria
        .keys()
        .map(|key| Ok(format!("{} = ?", identifier(key, statement)?)))
        .collect::<ShardResult<Vec<_>>>()?;
    Ok((conditions.join(" AND "), criteria.values().cloned().collect()))
}

fn syntax_error(statement: &str, reason: impl fmt::Display) -> ShardError {
    ShardError::QuerySyntax {
        statement: statement.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn map(value: Value) -> Criteria {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn statement_building() {
        let select = Statement::select(&map(json!({"id": 1, "name": "Alice"}))).unwrap();
        assert_eq!(select.sql, "SELECT * FROM records WHERE id = ? AND name = ?");
        assert_eq!(select.params, vec![json!(1), json!("Alice")]);
        assert_eq!(Statement::select(&Criteria::new()).unwrap().sql, "SELECT * FROM records");

        let insert = Statement::insert(&map(json!({"id": 1, "name": "Alice"}))).unwrap();
        assert_eq!(insert.sql, "INSERT INTO records (id, name) VALUES (?, ?)");
        assert_eq!(insert.params, vec![json!(1), json!("Alice")]);

        let update =
            Statement::update(&map(json!({"id": 1})), &map(json!({"name": "Bob", "age": 3}))).unwrap();
        assert_eq!(update.sql, "UPDATE records SET name = ?, age = ? WHERE id = ?");
        assert_eq!(update.params, vec![json!("Bob"), json!(3), json!(1)]);

        let delete = Statement::delete(&map(json!({"id": 1}))).unwrap();
        assert_eq!(delete.sql, "DELETE FROM records WHERE id = ?");
        assert_eq!(delete.params, vec![json!(1)]);
    }

    #[test]
    fn rejected_statements() {
        for err in [
            Statement::update(&Criteria::new(), &map(json!({"name": "x"}))).unwrap_err(),
            Statement::update(&map(json!({"id": 1})), &Record::new()).unwrap_err(),
            Statement::delete(&Criteria::new()).unwrap_err(),
            Statement::insert(&Record::new()).unwrap_err(),
            Statement::select(&map(json!({"id; DROP TABLE records": 1}))).unwrap_err(),
            Statement::insert(&map(json!({"1st": 1}))).unwrap_err(),
        ] {
            assert_eq!(err.code(), 1410, "unexpected error: {err}");
        }
    }

    #[test]
    fn run_and_evolve_schema() {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch("CREATE TABLE records (id PRIMARY KEY)")
            .unwrap();

        let record = map(json!({"id": 1, "name": "Alice", "score": 1.5}));
        ensure_columns(&connection, record.keys().map(String::as_str)).unwrap();
        ensure_columns(&connection, ["name", "NAME", "score"]).unwrap();
        assert!(is_syntax(&ensure_columns(&connection, ["bad name"]).unwrap_err()));
        let insert = Statement::insert(&record).unwrap();
        assert_eq!(run(&connection, &insert).unwrap(), Output::Affected(1));

        let other = map(json!({"id": 2}));
        run(&connection, &Statement::insert(&other).unwrap()).unwrap();

        let Output::Rows(rows) = run(&connection, &Statement::select(&Criteria::new()).unwrap()).unwrap()
        else {
            panic!("select must return rows");
        };
        // NULL columns are omitted.
        assert_eq!(rows, vec![record, other]);
    }

    #[test]
    fn error_classification() {
        let connection = Connection::open_in_memory().unwrap();
        let err = run(&connection, &Statement::new("SELEC nonsense", vec![])).unwrap_err();
        assert!(is_syntax(&err));
        assert!(!is_transient(&err));

        connection
            .execute_batch("CREATE TABLE records (id PRIMARY KEY)")
            .unwrap();
        let insert = Statement::new("INSERT INTO records (id) VALUES (?)", vec![json!(1)]);
        run(&connection, &insert).unwrap();
        let err = run(&connection, &insert).unwrap_err();
        assert!(!is_syntax(&err));
        assert!(!is_transient(&err));
        assert!(!is_broken(&err));
    }
}
