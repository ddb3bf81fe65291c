//! Durable keyed store shared by the queue, the cache tracker and the gateway.
//!
//! All state lives in [sled] trees and is only ever changed through multi-tree transactions or
//! compare-and-swap, so every transition is linearizable across workers and request handlers.
//! Key subscriptions ([sled::Subscriber]) replace polling for state changes.

use crate::error::PortalError;

use futures::future::{self, Future};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{IVec, Transactional, Tree};
use std::path::Path;

const HEALTH_KEY: &[u8] = b"health";

/// The trees of a store, as seen from inside a transaction.
pub struct TxTrees<'a> {
    pub jobs: &'a TransactionalTree,
    pub queue: &'a TransactionalTree,
    pub entries: &'a TransactionalTree,
    pub progress: &'a TransactionalTree,
    pub quota: &'a TransactionalTree,
}

/// Handle to the durable store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Store {
    db: sled::Db,
    /// fingerprint → [crate::job::BuildJob]
    pub jobs: Tree,
    /// queue sequence (big endian) → fingerprint
    pub queue: Tree,
    /// fingerprint → [crate::cache::CacheEntry]
    pub entries: Tree,
    /// fingerprint → [crate::job::BuildProgress]
    pub progress: Tree,
    /// identity → number of non-terminal builds (big endian)
    pub quota: Tree,
}

impl Store {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: &Path) -> Result<Self, PortalError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a store that is deleted when dropped.
    pub fn temporary() -> Result<Self, PortalError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, PortalError> {
        Ok(Self {
            jobs: db.open_tree("jobs")?,
            queue: db.open_tree("queue")?,
            entries: db.open_tree("entries")?,
            progress: db.open_tree("progress")?,
            quota: db.open_tree("quota")?,
            db,
        })
    }

    /// Returns a new, strictly increasing queue sequence number.
    pub fn next_sequence(&self) -> Result<u64, PortalError> {
        Ok(self.db.generate_id()?)
    }

    /// Checks that the store accepts writes.
    pub fn ping(&self) -> Result<(), PortalError> {
        self.db.insert(HEALTH_KEY, &[1u8][..])?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), PortalError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Runs `f` as a transaction over every tree.
    ///
    /// `f` may run more than once on conflicts, so it must not have side effects outside the
    /// store.
    pub fn transaction<A, F>(&self, f: F) -> Result<A, PortalError>
    where
        F: Fn(&TxTrees) -> ConflictableTransactionResult<A, PortalError>,
    {
        (
            &self.jobs,
            &self.queue,
            &self.entries,
            &self.progress,
            &self.quota,
        )
            .transaction(|(jobs, queue, entries, progress, quota)| {
                f(&TxTrees {
                    jobs,
                    queue,
                    entries,
                    progress,
                    quota,
                })
            })
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => err.into(),
            })
    }
}

/// Reads and decodes a record, returning the raw bytes alongside for compare-and-swap.
pub fn get<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<(IVec, T)>, PortalError> {
    match tree.get(key)? {
        Some(bytes) => {
            let value = decode(&bytes)?;
            Ok(Some((bytes, value)))
        }
        None => Ok(None),
    }
}

/// Replaces `old` with `new` if the record is unchanged. Returns whether the swap happened.
pub fn compare_and_swap<T: Serialize>(
    tree: &Tree,
    key: &[u8],
    old: Option<&IVec>,
    new: Option<&T>,
) -> Result<bool, PortalError> {
    let new = new.map(encode).transpose()?;
    Ok(tree.compare_and_swap(key, old, new)?.is_ok())
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PortalError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PortalError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// [decode] for use inside a transaction.
pub fn tx_decode<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, ConflictableTransactionError<PortalError>> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

/// [encode] for use inside a transaction.
pub fn tx_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ConflictableTransactionError<PortalError>> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

/// Returns a future that resolves on the next change of `key` in any of `trees`.
///
/// The subscription starts when this is called, so state read afterwards cannot miss a change.
pub fn changed(trees: &[&Tree], key: &[u8]) -> impl Future<Output = ()> + Send + 'static {
    let subscribers: Vec<_> = trees
        .iter()
        .map(|tree| Box::pin(tree.watch_prefix(key)))
        .collect();
    async move {
        if !subscribers.is_empty() {
            future::select_all(subscribers).await;
        }
    }
}

/// Reads a big endian counter.
pub fn decode_count(bytes: Option<IVec>) -> u64 {
    bytes
        .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sled::transaction::abort;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Record {
        n: u32,
    }

    #[test]
    fn compare_and_swap_detects_conflicts() {
        let store = Store::temporary().unwrap();
        assert!(compare_and_swap(&store.jobs, b"k", None, Some(&Record { n: 1 })).unwrap());
        let (bytes, record) = get::<Record>(&store.jobs, b"k").unwrap().unwrap();
        assert_eq!(Record { n: 1 }, record);
        assert!(!compare_and_swap(&store.jobs, b"k", None, Some(&Record { n: 2 })).unwrap());
        assert!(compare_and_swap(&store.jobs, b"k", Some(&bytes), Some(&Record { n: 2 })).unwrap());
        assert!(!compare_and_swap::<Record>(&store.jobs, b"k", Some(&bytes), None).unwrap());
    }

    #[test]
    fn aborted_transaction_writes_nothing() {
        let store = Store::temporary().unwrap();
        let result: Result<(), PortalError> = store.transaction(|tx| {
            tx.jobs.insert(&b"k"[..], &b"v"[..])?;
            tx.queue.insert(&b"q"[..], &b"k"[..])?;
            abort(PortalError::invalid("no"))
        });
        assert!(matches!(result, Err(PortalError::InvalidRequest { .. })));
        assert!(store.jobs.is_empty());
        assert!(store.queue.is_empty());
    }

    #[test]
    fn sequences_increase() {
        let store = Store::temporary().unwrap();
        let a = store.next_sequence().unwrap();
        let b = store.next_sequence().unwrap();
        assert!(b > a);
        store.ping().unwrap();
    }

    #[test]
    fn corrupt_records_are_reported() {
        let store = Store::temporary().unwrap();
        store.jobs.insert(b"k", &b"not json"[..]).unwrap();
        assert!(matches!(
            get::<Record>(&store.jobs, b"k").unwrap_err(),
            PortalError::CorruptRecord(_)
        ));
    }

    #[tokio::test]
    async fn changes_are_observed() {
        let store = Store::temporary().unwrap();
        let changed = changed(&[&store.jobs, &store.entries], b"k");
        store.entries.insert(b"k", &b"v"[..]).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), changed)
            .await
            .unwrap();
    }

    #[test]
    fn counters() {
        assert_eq!(0, decode_count(None));
        assert_eq!(7, decode_count(Some(IVec::from(&7u64.to_be_bytes()[..]))));
    }
}
