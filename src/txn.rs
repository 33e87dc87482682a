use {
    crate::{ShardError, ShardResult},
    auto_impl::auto_impl,
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::collections::HashMap,
    tracing::{debug, warn},
    uuid::Uuid,
};

/// Logical operation of a transaction.
///
/// Serialized as `{"type": "insert", "params": {"data": {...}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
pub enum Operation {
    Insert { data: Value },
    Update { criteria: Value, data: Value },
    Delete { criteria: Value },
}

impl Operation {
    /// Operation name, as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// Tracks the operations of transactions.
///
/// The contract gives no atomicity across shards: commit and rollback only
/// close the bookkeeping, they neither apply nor undo anything.
#[auto_impl(&, Box, Arc)]
pub trait TransactionCoordinator: Send + Sync {
    /// Opens a transaction and returns its id.
    fn begin(&self) -> String;

    /// Appends an operation to an open transaction.
    fn add_operation(&self, txn_id: &str, operation: Operation) -> ShardResult<()>;

    /// Operations recorded so far.
    fn operations(&self, txn_id: &str) -> ShardResult<Vec<Operation>>;

    /// Closes the transaction, returning its operations.
    fn commit(&self, txn_id: &str) -> ShardResult<Vec<Operation>>;

    /// Closes the transaction, discarding its operations.
    fn rollback(&self, txn_id: &str) -> ShardResult<()>;
}

/// Process-local operation log.
#[derive(Debug, Default)]
pub struct OperationLog {
    open: Mutex<HashMap<String, Vec<Operation>>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn close(&self, txn_id: &str) -> ShardResult<Vec<Operation>> {
        self.open
            .lock()
            .remove(txn_id)
            .ok_or_else(|| unknown_transaction(txn_id))
    }
}

impl TransactionCoordinator for OperationLog {
    fn begin(&self) -> String {
        let txn_id = format!("txn_{}", Uuid::new_v4().simple());
        self.open.lock().insert(txn_id.clone(), Vec::new());
        debug!(%txn_id, "Transaction started");
        txn_id
    }

    fn add_operation(&self, txn_id: &str, operation: Operation) -> ShardResult<()> {
        let mut open = self.open.lock();
        let operations = open.get_mut(txn_id).ok_or_else(|| unknown_transaction(txn_id))?;
        operations.push(operation);
        Ok(())
    }

    fn operations(&self, txn_id: &str) -> ShardResult<Vec<Operation>> {
        self.open
            .lock()
            .get(txn_id)
            .cloned()
            .ok_or_else(|| unknown_transaction(txn_id))
    }

    fn commit(&self, txn_id: &str) -> ShardResult<Vec<Operation>> {
        let operations = self.close(txn_id)?;
        debug!(%txn_id, count = operations.len(), "Transaction committed");
        Ok(operations)
    }

    fn rollback(&self, txn_id: &str) -> ShardResult<()> {
        let operations = self.close(txn_id)?;
        warn!(
            %txn_id,
            count = operations.len(),
            "Transaction rolled back (best-effort): applied operations are not undone"
        );
        Ok(())
    }
}

fn unknown_transaction(txn_id: &str) -> ShardError {
    ShardError::Transaction(format!("unknown transaction {txn_id}"))
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn operation_serde() {
        let op: Operation = serde_json::from_value(json!({
            "type": "update",
            "params": {"criteria": {"id": 4}, "data": {"name": "Dave"}}
        }))
        .unwrap();
        assert_eq!(op, Operation::Update {
            criteria: json!({"id": 4}),
            data: json!({"name": "Dave"}),
        });
        assert_eq!(op.name(), "update");

        let insert = Operation::Insert {
            data: json!({"id": 1}),
        };
        assert_eq!(
            serde_json::to_value(&insert).unwrap(),
            json!({"type": "insert", "params": {"data": {"id": 1}}})
        );

        assert!(serde_json::from_value::<Operation>(json!({"type": "merge", "params": {}})).is_err());
    }

    #[test]
    fn log_lifecycle() {
        let log = OperationLog::new();
        let txn = log.begin();
        assert_ne!(txn, log.begin());

        let op = Operation::Delete {
            criteria: json!({"id": 1}),
        };
        log.add_operation(&txn, op.clone()).unwrap();
        assert_eq!(log.operations(&txn).unwrap(), vec![op.clone()]);
        assert_eq!(log.commit(&txn).unwrap(), vec![op.clone()]);

        // Closed transactions are gone.
        assert_eq!(log.add_operation(&txn, op).unwrap_err().code(), 1500);
        assert!(log.commit(&txn).is_err());
        assert!(log.rollback("txn_missing").is_err());

        let txn = log.begin();
        log.rollback(&txn).unwrap();
        assert!(log.operations(&txn).is_err());
    }
}
