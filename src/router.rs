use {
    crate::{
        Criteria,
        KEY_FIELD,
        Record,
        ShardError,
        ShardId,
        ShardResult,
        ShardingStrategy,
        executor::{Executor, worker_pool},
        record::compare_values,
        statement::{Output, Statement},
    },
    rayon::prelude::*,
    serde_json::Value,
    std::{
        collections::{BTreeMap, HashSet},
        sync::Arc,
    },
    tracing::{debug, error},
};

/// Merged result of a statement executed on one or more shards.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Rows of every shard, deduplicated and sorted by their first column.
    Rows(Vec<Record>),

    /// Affected row count per shard.
    Affected(BTreeMap<ShardId, usize>),
}

impl QueryResult {
    /// Returns the rows, or nothing for a write.
    pub fn into_rows(self) -> Vec<Record> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Affected(_) => Vec::new(),
        }
    }

    /// Total number of affected rows, or the row count of a query.
    pub fn affected(&self) -> usize {
        match self {
            QueryResult::Rows(rows) => rows.len(),
            QueryResult::Affected(counts) => counts.values().sum(),
        }
    }
}

/// Fans statements out to shards and merges the results.
///
/// Shards of one call are executed concurrently on a bounded worker pool,
/// one task per shard.
pub struct QueryRouter {
    strategy: Arc<dyn ShardingStrategy>,
    executor: Executor,
    workers: rayon::ThreadPool,
}

impl QueryRouter {
    /// Creates a router running at most `max_workers` shard tasks at once.
    pub fn new(strategy: Arc<dyn ShardingStrategy>, executor: Executor, max_workers: usize) -> ShardResult<Self> {
        Ok(Self {
            strategy,
            executor,
            workers: worker_pool("sqlshard-router", max_workers)?,
        })
    }

    /// Executes a statement on the given shards, or on every shard of the
    /// strategy when `shard_ids` is `None`.
    ///
    /// If any shard fails, the whole call fails with
    /// [`ShardError::Sharding`] naming the first failing shard (in the order
    /// the shards were given); results of the other shards are discarded.
    pub fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        shard_ids: Option<&[ShardId]>,
    ) -> ShardResult<QueryResult> {
        let statement = Statement::new(sql, params.to_vec());
        let all_shards;
        let shard_ids: &[ShardId] = match shard_ids {
            Some(shard_ids) => shard_ids,
            None => {
                all_shards = self.strategy.all_shards();
                &all_shards
            }
        };
        debug!(%statement, shards = shard_ids.len(), "Fanning out statement");

        let outputs: Vec<(&ShardId, ShardResult<Output>)> = self.workers.install(|| {
            shard_ids
                .par_iter()
                .map(|shard_id| (shard_id, self.executor.execute(shard_id, &statement, &[])))
                .collect()
        });

        let mut merged = Vec::with_capacity(outputs.len());
        for (shard_id, output) in outputs {
            match output {
                Ok(output) => merged.push((shard_id.clone(), output)),
                Err(err) => {
                    error!(%shard_id, %statement, error = %err, "Query execution failed on shard");
                    return Err(ShardError::on_shard("Query execution failed", shard_id.clone(), err));
                }
            }
        }
        Ok(aggregate(merged))
    }

    /// Executes a statement on the shards the strategy picks for the
    /// criteria.
    pub fn execute_read(&self, sql: &str, params: &[Value], criteria: &Criteria) -> ShardResult<QueryResult> {
        let shard_ids = self.strategy.resolve_for_query(criteria)?;
        self.execute_query(sql, params, Some(&shard_ids))
    }

    /// Executes a statement on the single shard owning `data.id`.
    pub fn execute_write(&self, sql: &str, params: &[Value], data: &Record) -> ShardResult<QueryResult> {
        let shard_id = self
            .strategy
            .resolve_for_key(data.get(KEY_FIELD).unwrap_or(&Value::Null))?;
        let statement = Statement::new(sql, params.to_vec());
        let output = self.executor.execute(&shard_id, &statement, &[])?;
        Ok(aggregate(vec![(shard_id, output)]))
    }

    /// Strategy the router resolves shards with.
    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.strategy
    }
}

/// Merges per-shard outputs.
///
/// Row sets are concatenated, identical rows are kept once, and the result is
/// sorted by the value of each row's first column. Counts pass through per
/// shard.
fn aggregate(outputs: Vec<(ShardId, Output)>) -> QueryResult {
    let returns_rows = outputs.iter().any(|(_, output)| matches!(output, Output::Rows(_)));
    if !returns_rows && !outputs.is_empty() {
        let counts = outputs
            .into_iter()
            .map(|(shard_id, output)| match output {
                Output::Affected(count) => (shard_id, count),
                Output::Rows(rows) => (shard_id, rows.len()),
            })
            .collect();
        return QueryResult::Affected(counts);
    }

    let mut seen = HashSet::new();
    let mut rows: Vec<Record> = outputs
        .into_iter()
        .filter_map(|(_, output)| match output {
            Output::Rows(rows) => Some(rows),
            Output::Affected(_) => None,
        })
        .flatten()
        .filter(|row| seen.insert(Value::Object(row.clone()).to_string()))
        .collect();
    rows.sort_by(|a, b| compare_values(first_column(a), first_column(b)));
    QueryResult::Rows(rows)
}

fn first_column(row: &Record) -> &Value {
    row.values().next().unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{ConnectionPool, RangeStrategy, executor::RetryPolicy},
        serde_json::json,
        std::time::Duration,
    };

    fn router(dir: &tempfile::TempDir) -> QueryRouter {
        let strategy = RangeStrategy::new();
        strategy.add_range(0, 100, &ShardId::from("low")).unwrap();
        strategy.add_range(100, 200, &ShardId::from("high")).unwrap();
        let pool = ConnectionPool::new(dir.path(), 2, Duration::from_secs(5)).unwrap();
        QueryRouter::new(
            Arc::new(strategy),
            Executor::new(Arc::new(pool), RetryPolicy::default()),
            4,
        )
        .unwrap()
    }

    fn insert(router: &QueryRouter, id: i64) {
        let data = json!({"id": id});
        let result = router
            .execute_write("INSERT INTO records (id) VALUES (?)", &[json!(id)], data.as_object().unwrap())
            .unwrap();
        assert_eq!(result.affected(), 1);
    }

    #[test]
    fn fan_out_merges_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(&dir);
        for id in [150, 5, 120, 42] {
            insert(&router, id);
        }

        let rows = router
            .execute_query("SELECT id FROM records", &[], None)
            .unwrap()
            .into_rows();
        let ids: Vec<i64> = rows.iter().map(|row| row["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![5, 42, 120, 150]);

        // Identical rows from different shards are kept once.
        let rows = router
            .execute_query("SELECT 'same' AS tag", &[], None)
            .unwrap()
            .into_rows();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn explicit_and_criteria_targets() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(&dir);
        insert(&router, 5);
        insert(&router, 150);

        let low = [ShardId::from("low")];
        let rows = router
            .execute_query("SELECT id FROM records", &[], Some(&low))
            .unwrap()
            .into_rows();
        assert_eq!(rows.len(), 1);

        let criteria = json!({"id": 150});
        let rows = router
            .execute_read(
                "SELECT id FROM records WHERE id = ?",
                &[json!(150)],
                criteria.as_object().unwrap(),
            )
            .unwrap()
            .into_rows();
        assert_eq!(rows[0]["id"], json!(150));

        let result = router
            .execute_query("DELETE FROM records WHERE id < ?", &[json!(1000)], None)
            .unwrap();
        let QueryResult::Affected(counts) = result else {
            panic!("delete must report affected rows");
        };
        assert_eq!(counts[&ShardId::from("low")], 1);
        assert_eq!(counts[&ShardId::from("high")], 1);
    }

    #[test]
    fn failing_shard_fails_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(&dir);
        let err = router
            .execute_query("SELECT missing_column FROM records", &[], None)
            .unwrap_err();
        assert_eq!(err.code(), 1000);
        assert_eq!(err.shard_id(), Some(&ShardId::from("high")));

        let data = json!({"id": 500});
        let err = router
            .execute_write("INSERT INTO records (id) VALUES (?)", &[json!(500)], data.as_object().unwrap())
            .unwrap_err();
        assert_eq!(err.code(), 1320);
    }
}
