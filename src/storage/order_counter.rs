use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use rocksdb::TransactionDB;

use crate::contracts::{GenerationFailure, OrderNumber, OrderNumberGenerator};
use crate::storage::rocksdb::begin_transaction;

/// Key of the singleton order counter row.
pub(crate) const ORDER_COUNTER_KEY: &[u8] = b"counter:order";

/// Order-number generator backed by one row of a transactional store.
///
/// Each allocation is a read-increment-write inside its own pessimistic
/// transaction, so the row lock serializes concurrent callers across threads
/// and across processes sharing the database. Nothing is cached in memory.
pub struct RocksDbOrderCounter {
    db: Arc<TransactionDB>,
    lock_timeout_ms: i64,
}

impl RocksDbOrderCounter {
    pub(crate) fn new(db: Arc<TransactionDB>, lock_timeout_ms: i64) -> Self {
        Self {
            db,
            lock_timeout_ms,
        }
    }
}

/// Parses a stored counter value (big-endian u64).
fn parse_counter(bytes: &[u8]) -> Result<u64, GenerationFailure> {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| GenerationFailure::CorruptCounter(format!("{} bytes", bytes.len())))
}

impl OrderNumberGenerator for RocksDbOrderCounter {
    fn next_order_number_at<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<OrderNumber, GenerationFailure> {
        // Dropping `txn` on any early return rolls back and releases the lock.
        let txn = begin_transaction(&self.db, self.lock_timeout_ms);

        // Absent row reads as 0 and is created by the put below.
        let current = match txn.get_for_update(ORDER_COUNTER_KEY, true)? {
            Some(bytes) => parse_counter(&bytes)?,
            None => 0,
        };
        let next = current.checked_add(1).ok_or(GenerationFailure::Overflow)?;

        txn.put(ORDER_COUNTER_KEY, next.to_be_bytes())?;
        txn.commit()?;

        let order_no = OrderNumber::issued_at(next, now);
        tracing::debug!(order_no = %order_no, "Allocated order number");
        Ok(order_no)
    }

    fn current_sequence(&self) -> Result<u64, GenerationFailure> {
        match self.db.get(ORDER_COUNTER_KEY)? {
            Some(bytes) => parse_counter(&bytes),
            None => Ok(0),
        }
    }
}
