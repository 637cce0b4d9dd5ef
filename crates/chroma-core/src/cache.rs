//! Persistent output cache and coordination primitives.
//!
//! Backed by a `sled` database with two trees: `outputs` maps outpoints to
//! their resolved [`ColoredOutput`]s, and `crowdsale` maps sale ids to
//! their [`CrowdsaleState`]. Output entries carry a last-seen stamp
//! refreshed on every read; entries this process never evicts (outputs
//! spent by another wallet get no broadcast here) age out when the store
//! opens. Raw transactions are memoized in a bounded in-memory LRU since
//! they are cheap to re-fetch.
//!
//! The store also hosts two advisory coordination mechanisms used while
//! building transactions: TTL-bounded outpoint reservations (so two
//! concurrent builds never select the same funding output) and per-address
//! locks (so operations against one address are linearized).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use lru::LruCache;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::crowdsale::CrowdsaleState;
use crate::error::CoreError;
use crate::types::ColoredOutput;

const OUTPUTS_TREE: &str = "outputs";
const CROWDSALE_TREE: &str = "crowdsale";

/// Raw transactions kept in memory. Resolved colored outputs live in sled;
/// the raw form only matters while a coloring walk is in flight.
const RAW_TX_CACHE_CAP: usize = 1024;

/// How long an outpoint reservation survives without being released.
/// Covers a slow sign-and-broadcast round trip; a crashed caller's
/// reservations expire instead of wedging the store.
const RESERVATION_TTL: Duration = Duration::from_secs(120);

/// Output entries untouched for this long are dropped when the store
/// opens. Entries still part of wallet listings or coloring walks are
/// re-stamped on every read, so only abandoned entries age out.
const OUTPUT_ENTRY_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// On-disk form of an output entry: the resolved output plus the seconds
/// since the Unix epoch it was last read or written.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredOutput {
    output: ColoredOutput,
    last_seen: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

// ==============================================================================
// Output Store
// ==============================================================================

pub struct OutputStore {
    db: sled::Db,
    outputs: sled::Tree,
    crowdsale: sled::Tree,
    raw_txs: Mutex<LruCache<Txid, Transaction>>,
    reservations: StdMutex<HashMap<OutPoint, Instant>>,
    address_locks: StdMutex<HashMap<ScriptBuf, Arc<Mutex<()>>>>,
}

impl OutputStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store for tests; nothing survives drop.
    pub fn temporary() -> Result<Self, CoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, CoreError> {
        let outputs = db.open_tree(OUTPUTS_TREE)?;
        let crowdsale = db.open_tree(CROWDSALE_TREE)?;
        let cap = NonZeroUsize::new(RAW_TX_CACHE_CAP)
            .ok_or_else(|| CoreError::InvalidData("raw tx cache capacity is zero".into()))?;
        let store = Self {
            db,
            outputs,
            crowdsale,
            raw_txs: Mutex::new(LruCache::new(cap)),
            reservations: StdMutex::new(HashMap::new()),
            address_locks: StdMutex::new(HashMap::new()),
        };
        store.prune_stale_outputs()?;
        Ok(store)
    }

    /// Drop output entries not seen within [`OUTPUT_ENTRY_TTL`]. Outputs
    /// spent by another wallet never get an eviction call from this
    /// process, so age is the only bound on the tree.
    fn prune_stale_outputs(&self) -> Result<(), CoreError> {
        let cutoff = unix_now().saturating_sub(OUTPUT_ENTRY_TTL.as_secs());
        let mut pruned = 0usize;
        for entry in self.outputs.iter() {
            let (key, raw) = entry?;
            match decode_value::<StoredOutput>(&raw) {
                Ok(stored) if stored.last_seen >= cutoff => {}
                // Stale, or unreadable under the current format.
                _ => {
                    self.outputs.remove(&key)?;
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "dropped stale output cache entries");
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), CoreError> {
        self.db.flush()?;
        Ok(())
    }

    // -- Colored outputs -------------------------------------------------------

    pub fn get_output(&self, outpoint: &OutPoint) -> Result<Option<ColoredOutput>, CoreError> {
        let key = outpoint_key(outpoint);
        match self.outputs.get(key)? {
            Some(raw) => {
                let mut stored: StoredOutput = decode_value(&raw)?;
                stored.last_seen = unix_now();
                self.outputs.insert(key, encode_value(&stored)?)?;
                Ok(Some(stored.output))
            }
            None => Ok(None),
        }
    }

    pub fn put_output(
        &self,
        outpoint: &OutPoint,
        output: &ColoredOutput,
    ) -> Result<(), CoreError> {
        let stored = StoredOutput {
            output: output.clone(),
            last_seen: unix_now(),
        };
        self.outputs
            .insert(outpoint_key(outpoint), encode_value(&stored)?)?;
        Ok(())
    }

    /// Drop cache entries for outputs consumed by a broadcast transaction.
    pub fn evict_spent(&self, outpoints: &[OutPoint]) -> Result<(), CoreError> {
        for outpoint in outpoints {
            self.outputs.remove(outpoint_key(outpoint))?;
        }
        Ok(())
    }

    // -- Raw transactions ------------------------------------------------------

    pub async fn cached_transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.raw_txs.lock().await.get(txid).cloned()
    }

    pub async fn cache_transaction(&self, tx: Transaction) {
        self.raw_txs.lock().await.put(tx.compute_txid(), tx);
    }

    // -- Crowdsale state -------------------------------------------------------

    pub fn get_crowdsale_state(&self, sale_id: &str) -> Result<Option<CrowdsaleState>, CoreError> {
        match self.crowdsale.get(sale_id.as_bytes())? {
            Some(raw) => Ok(Some(decode_value(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist and flush a sale record. Must complete before any
    /// distribution planned against the record is broadcast.
    pub fn put_crowdsale_state(&self, state: &CrowdsaleState) -> Result<(), CoreError> {
        self.crowdsale
            .insert(state.sale_id.as_bytes(), encode_value(state)?)?;
        self.crowdsale.flush()?;
        Ok(())
    }

    // -- Outpoint reservations -------------------------------------------------

    /// Reserve a set of outpoints for the duration of a build. Returns a
    /// guard that releases them on drop, or
    /// [`CoreError::ReservationConflict`] if any outpoint is already held
    /// by a live reservation.
    pub fn reserve(
        self: &Arc<Self>,
        outpoints: &[OutPoint],
    ) -> Result<ReservationGuard, CoreError> {
        let now = Instant::now();
        let mut held = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.retain(|outpoint, taken_at| {
            let live = now.duration_since(*taken_at) < RESERVATION_TTL;
            if !live {
                debug!(%outpoint, "expiring stale outpoint reservation");
            }
            live
        });

        if let Some(conflict) = outpoints.iter().find(|outpoint| held.contains_key(outpoint)) {
            return Err(CoreError::ReservationConflict(*conflict));
        }
        for outpoint in outpoints {
            held.insert(*outpoint, now);
        }
        drop(held);

        Ok(ReservationGuard {
            store: Arc::clone(self),
            outpoints: outpoints.to_vec(),
        })
    }

    fn release(&self, outpoints: &[OutPoint]) {
        let mut held = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for outpoint in outpoints {
            held.remove(outpoint);
        }
    }

    // -- Address locks ---------------------------------------------------------

    /// Serialize operations against one address. The lock is advisory and
    /// process-local.
    pub async fn lock_address(&self, script: &ScriptBuf) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .address_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(script.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Holds a set of outpoint reservations; dropping it releases them.
pub struct ReservationGuard {
    store: Arc<OutputStore>,
    outpoints: Vec<OutPoint>,
}

impl ReservationGuard {
    pub fn outpoints(&self) -> &[OutPoint] {
        &self.outpoints
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.store.release(&self.outpoints);
    }
}

// ==============================================================================
// Encoding
// ==============================================================================

fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.txid.to_byte_array());
    key[32..].copy_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn encode_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value)
        .map_err(|err| CoreError::InvalidData(format!("cannot encode cache entry: {err}")))
}

fn decode_value<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T, CoreError> {
    serde_json::from_slice(raw)
        .map_err(|err| CoreError::InvalidData(format!("corrupt cache entry: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    use crate::test_util::{make_tx, p2wpkh_script, txid_from_byte, txout};
    use crate::types::OutputKind;

    fn sample_output(sats: u64) -> ColoredOutput {
        ColoredOutput::uncolored(Amount::from_sat(sats), p2wpkh_script(1))
    }

    #[test]
    fn outputs_round_trip_and_evict() {
        let store = OutputStore::temporary().unwrap();
        let outpoint = OutPoint::new(txid_from_byte(1), 3);

        assert!(store.get_output(&outpoint).unwrap().is_none());
        store.put_output(&outpoint, &sample_output(600)).unwrap();
        let hit = store.get_output(&outpoint).unwrap().unwrap();
        assert_eq!(hit.value, Amount::from_sat(600));
        assert_eq!(hit.kind, OutputKind::Uncolored);

        store.evict_spent(&[outpoint]).unwrap();
        assert!(store.get_output(&outpoint).unwrap().is_none());
    }

    #[test]
    fn outputs_survive_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let outpoint = OutPoint::new(txid_from_byte(9), 0);

        {
            let store = OutputStore::open(dir.path()).unwrap();
            store.put_output(&outpoint, &sample_output(1_000)).unwrap();
            store.flush().unwrap();
        }

        let store = OutputStore::open(dir.path()).unwrap();
        assert!(store.get_output(&outpoint).unwrap().is_some());
    }

    #[test]
    fn stale_output_entries_are_pruned_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = OutPoint::new(txid_from_byte(1), 0);
        let stale = OutPoint::new(txid_from_byte(2), 0);

        {
            let store = OutputStore::open(dir.path()).unwrap();
            store.put_output(&fresh, &sample_output(600)).unwrap();
            // An entry last seen at the epoch, as if untouched for years.
            let expired = StoredOutput {
                output: sample_output(700),
                last_seen: 0,
            };
            store
                .outputs
                .insert(outpoint_key(&stale), encode_value(&expired).unwrap())
                .unwrap();
            store.flush().unwrap();
        }

        let store = OutputStore::open(dir.path()).unwrap();
        assert!(store.get_output(&fresh).unwrap().is_some());
        assert!(store.get_output(&stale).unwrap().is_none());
    }

    #[test]
    fn crowdsale_state_round_trips() {
        let store = OutputStore::temporary().unwrap();
        assert!(store.get_crowdsale_state("sale").unwrap().is_none());

        let mut state = CrowdsaleState::new("sale");
        state.cumulative_received = 42_000;
        state.total_issued = 7;
        state.processed.insert(txid_from_byte(5));
        store.put_crowdsale_state(&state).unwrap();

        let loaded = store.get_crowdsale_state("sale").unwrap().unwrap();
        assert_eq!(loaded.cumulative_received, 42_000);
        assert_eq!(loaded.total_issued, 7);
        assert!(loaded.processed.contains(&txid_from_byte(5)));
    }

    #[tokio::test]
    async fn raw_transactions_are_memoized() {
        let store = OutputStore::temporary().unwrap();
        let tx = make_tx(
            vec![OutPoint::new(txid_from_byte(1), 0)],
            vec![txout(500, p2wpkh_script(2))],
        );
        let txid = tx.compute_txid();

        assert!(store.cached_transaction(&txid).await.is_none());
        store.cache_transaction(tx.clone()).await;
        assert_eq!(store.cached_transaction(&txid).await, Some(tx));
    }

    #[test]
    fn reservations_conflict_until_released() {
        let store = Arc::new(OutputStore::temporary().unwrap());
        let a = OutPoint::new(txid_from_byte(1), 0);
        let b = OutPoint::new(txid_from_byte(1), 1);

        let guard = store.reserve(&[a, b]).unwrap();
        assert!(matches!(
            store.reserve(&[b]),
            Err(CoreError::ReservationConflict(conflict)) if conflict == b
        ));
        // Disjoint sets coexist.
        let other = store.reserve(&[OutPoint::new(txid_from_byte(2), 0)]).unwrap();
        drop(other);

        drop(guard);
        store.reserve(&[a, b]).unwrap();
    }

    #[tokio::test]
    async fn address_lock_serializes_holders() {
        let store = OutputStore::temporary().unwrap();
        let script = p2wpkh_script(1);

        let held = store.lock_address(&script).await;
        let contender = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            store.lock_address(&script),
        )
        .await;
        assert!(contender.is_err());

        drop(held);
        store.lock_address(&script).await;
    }
}
