use {
    super::{CrudHandler, DefaultHandler},
    crate::{
        Record,
        ShardError,
        ShardResult,
        executor::worker_pool,
        record::as_mapping_list,
    },
    rayon::prelude::*,
    serde_json::{Map, Value},
    std::sync::Arc,
    tracing::{debug, info},
};

/// Handler for lists of records or criteria.
///
/// Input is cut into chunks of `batch_size`; the items of one chunk are
/// dispatched concurrently to the single-record path of a
/// [`DefaultHandler`], and chunks run one after another. Chunks only bound
/// concurrency: a failure leaves the items processed before it committed and
/// fails the whole call.
#[derive(Clone)]
pub struct BatchHandler {
    single: DefaultHandler,
    batch_size: usize,
    workers: Arc<rayon::ThreadPool>,
}

impl BatchHandler {
    /// Creates a handler that runs at most `max_workers` items at once.
    pub fn new(single: DefaultHandler, batch_size: usize, max_workers: usize) -> ShardResult<Self> {
        if batch_size == 0 {
            return Err(ShardError::Configuration(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            single,
            batch_size,
            workers: Arc::new(worker_pool("sqlshard-batch", max_workers)?),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Splits items into consecutive chunks of at most `batch_size`.
    pub fn chunks<'a, T>(&self, items: &'a [T]) -> impl Iterator<Item = &'a [T]> {
        items.chunks(self.batch_size)
    }

    /// Inserts every record; returns the number of inserted rows.
    pub fn insert_all(&self, records: &[&Record]) -> ShardResult<usize> {
        let total = self.run_chunked(records, |record| self.single.insert_record(record))?;
        info!(count = records.len(), inserted = total, "Inserted batch");
        Ok(total)
    }

    /// Runs one select per criterion and concatenates the results.
    ///
    /// Results of different criteria come back in no particular order.
    pub fn select_all(&self, criteria: &[&Record]) -> ShardResult<Vec<Record>> {
        let mut records = Vec::new();
        for chunk in self.chunks(criteria) {
            let found = self.workers.install(|| {
                chunk
                    .par_iter()
                    .map(|criteria| self.single.select_matching(criteria))
                    .collect::<ShardResult<Vec<_>>>()
            })?;
            records.extend(found.into_iter().flatten());
        }
        Ok(records)
    }

    /// Applies `data[i]` to the records matching `criteria[i]`.
    pub fn update_all(&self, criteria: &[&Record], data: &[&Record]) -> ShardResult<usize> {
        if criteria.len() != data.len() {
            return Err(ShardError::sharding(format!(
                "batch update needs as many criteria as data items, got {} and {}",
                criteria.len(),
                data.len()
            )));
        }
        let pairs: Vec<(&Record, &Record)> = criteria.iter().copied().zip(data.iter().copied()).collect();
        let total = self.run_chunked(&pairs, |(criteria, data)| self.single.update_matching(criteria, data))?;
        info!(count = pairs.len(), updated = total, "Updated batch");
        Ok(total)
    }

    /// Deletes the records matching any of the criteria.
    pub fn delete_all(&self, criteria: &[&Record]) -> ShardResult<usize> {
        let total = self.run_chunked(criteria, |criteria| self.single.delete_matching(criteria))?;
        info!(count = criteria.len(), deleted = total, "Deleted batch");
        Ok(total)
    }

    /// Runs `op` on every item, chunk by chunk, summing the results.
    fn run_chunked<T, F>(&self, items: &[T], op: F) -> ShardResult<usize>
    where
        T: Sync,
        F: Fn(&T) -> ShardResult<usize> + Sync,
    {
        let mut total = 0;
        for (idx, chunk) in self.chunks(items).enumerate() {
            let counts = self.workers.install(|| {
                chunk
                    .par_iter()
                    .map(&op)
                    .collect::<ShardResult<Vec<usize>>>()
            })?;
            debug!(chunk = idx, size = chunk.len(), "Processed chunk");
            total += counts.into_iter().sum::<usize>();
        }
        Ok(total)
    }
}

impl CrudHandler for BatchHandler {
    /// Accepts a list of records; a single record is treated as a list of
    /// one.
    fn insert(&self, data: &Value) -> ShardResult<usize> {
        self.insert_all(&list_operand(data, "data")?)
    }

    fn select(&self, criteria: &Value) -> ShardResult<Vec<Record>> {
        self.select_all(&list_operand(criteria, "criteria")?)
    }

    /// Both operands are lists of equal length, paired by position.
    fn update(&self, criteria: &Value, data: &Value) -> ShardResult<usize> {
        let criteria = list_operand(criteria, "criteria")?;
        let data = list_operand(data, "data")?;
        self.update_all(&criteria, &data)
    }

    fn delete(&self, criteria: &Value) -> ShardResult<usize> {
        self.delete_all(&list_operand(criteria, "criteria")?)
    }
}

fn list_operand<'a>(value: &'a Value, what: &str) -> ShardResult<Vec<&'a Map<String, Value>>> {
    match value {
        Value::Object(map) => Ok(vec![map]),
        _ => as_mapping_list(value, what),
    }
}
