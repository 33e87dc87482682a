use {
    super::CrudHandler,
    crate::{
        Criteria,
        KEY_FIELD,
        Record,
        ShardResult,
        ShardingStrategy,
        executor::Executor,
        record::{as_mapping, as_mapping_list},
        statement::{Output, Statement},
    },
    serde_json::Value,
    std::sync::Arc,
    tracing::info,
};

/// Single-record handler.
///
/// Writes go to the one shard owning the record's `id`; reads, updates and
/// deletes go to every shard the strategy returns for the criteria, one
/// after another.
#[derive(Clone)]
pub struct DefaultHandler {
    strategy: Arc<dyn ShardingStrategy>,
    executor: Executor,
}

impl DefaultHandler {
    pub fn new(strategy: Arc<dyn ShardingStrategy>, executor: Executor) -> Self {
        Self { strategy, executor }
    }

    /// Inserts one record into the shard owning its `id`.
    ///
    /// A record without `id` fails with
    /// [`ShardError::InvalidKey`](crate::ShardError::InvalidKey).
    pub fn insert_record(&self, record: &Record) -> ShardResult<usize> {
        let key = record.get(KEY_FIELD).unwrap_or(&Value::Null);
        let shard_id = self.strategy.resolve_for_key(key)?;
        let statement = Statement::insert(record)?;
        let columns: Vec<&str> = record.keys().map(String::as_str).collect();

        let affected = affected(self.executor.execute(&shard_id, &statement, &columns)?);
        info!(%shard_id, id = %key, "Inserted record");
        Ok(affected)
    }

    /// Returns the records matching the criteria across candidate shards.
    pub fn select_matching(&self, criteria: &Criteria) -> ShardResult<Vec<Record>> {
        let statement = Statement::select(criteria)?;
        let columns: Vec<&str> = criteria.keys().map(String::as_str).collect();

        let mut records = Vec::new();
        for shard_id in self.strategy.resolve_for_query(criteria)? {
            if let Output::Rows(rows) = self.executor.execute(&shard_id, &statement, &columns)? {
                info!(%shard_id, count = rows.len(), "Selected records");
                records.extend(rows);
            }
        }
        Ok(records)
    }

    /// Applies `data` to the records matching the criteria.
    pub fn update_matching(&self, criteria: &Criteria, data: &Record) -> ShardResult<usize> {
        let statement = Statement::update(criteria, data)?;
        let columns: Vec<&str> = data
            .keys()
            .chain(criteria.keys())
            .map(String::as_str)
            .collect();

        let mut total = 0;
        for shard_id in self.strategy.resolve_for_query(criteria)? {
            let count = affected(self.executor.execute(&shard_id, &statement, &columns)?);
            info!(%shard_id, count, "Updated records");
            total += count;
        }
        Ok(total)
    }

    /// Deletes the records matching the criteria.
    pub fn delete_matching(&self, criteria: &Criteria) -> ShardResult<usize> {
        let statement = Statement::delete(criteria)?;
        let columns: Vec<&str> = criteria.keys().map(String::as_str).collect();

        let mut total = 0;
        for shard_id in self.strategy.resolve_for_query(criteria)? {
            let count = affected(self.executor.execute(&shard_id, &statement, &columns)?);
            info!(%shard_id, count, "Deleted records");
            total += count;
        }
        Ok(total)
    }
}

impl CrudHandler for DefaultHandler {
    /// Accepts a single record or a small list of records, inserted in
    /// order.
    fn insert(&self, data: &Value) -> ShardResult<usize> {
        if data.is_array() {
            let mut total = 0;
            for record in as_mapping_list(data, "data")? {
                total += self.insert_record(record)?;
            }
            return Ok(total);
        }
        self.insert_record(as_mapping(data, "data")?)
    }

    fn select(&self, criteria: &Value) -> ShardResult<Vec<Record>> {
        self.select_matching(as_mapping(criteria, "criteria")?)
    }

    fn update(&self, criteria: &Value, data: &Value) -> ShardResult<usize> {
        let criteria = as_mapping(criteria, "criteria")?;
        let data = as_mapping(data, "data")?;
        self.update_matching(criteria, data)
    }

    fn delete(&self, criteria: &Value) -> ShardResult<usize> {
        self.delete_matching(as_mapping(criteria, "criteria")?)
    }
}

fn affected(output: Output) -> usize {
    match output {
        Output::Affected(count) => count,
        Output::Rows(rows) => rows.len(),
    }
}
