use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use rocksdb::{
    Cache, ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, ReadOptions,
    WriteBatch,
};
use tracing::info;

use crate::error::Error;
use crate::model::{Outpoint, Score};
use crate::storage::encdec::{Decode, Encode, EncodeBuilder, VarUInt, prefix_key_range};

use super::event_log::{EventLogStore, LogEntry, TxoRecord};

static TAPESTRY_CF_NAME: &str = "tapestry";

// Table prefixes within the single column family. Do not modify, only add.
const SCORE_INDEX: u8 = b'S';
const MEMBER_SCORE: u8 = b'M';
const TXO: u8 = b'T';
const TXO_DATA: u8 = b'D';
const SPEND: u8 = b'P';

/// RocksDB-backed event log. Log entries are stored twice: a `(key, member)`
/// row holding the score for point lookups and uniqueness, and a
/// `(key, score, member)` row for ordered range scans. VarUInt score
/// encoding keeps the scan rows in score order.
pub struct RocksStore {
    db: Arc<DB>,
    /// Serializes read-modify-write of the paired index rows and spend
    /// claims; plain writes don't take it.
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: PathBuf, read_only: bool, memory_budget: u64) -> Result<Self, Error> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(2);
        db_opts.set_max_background_jobs(cpus.max(2));

        info!(
            "using rocksdb memory budget: {:.2} GB ({} bytes)",
            memory_budget as f64 / 1024.0 / 1024.0 / 1024.0,
            memory_budget
        );

        let block_cache_budget = (memory_budget as f64 * 0.75) as usize;
        let memtable_budget = (memory_budget as f64 * 0.25) as usize;

        let cache = Cache::new_lru_cache(block_cache_budget);

        let mut cf_opts = Options::default();

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        cf_opts.set_block_based_table_factory(&block_opts);

        let per_memtable_cap = 512 * 1024 * 1024;
        cf_opts.set_write_buffer_size(std::cmp::min(memtable_budget.max(1) / 2, per_memtable_cap));
        cf_opts.set_max_write_buffer_number(2);

        let cfs = vec![ColumnFamilyDescriptor::new(TAPESTRY_CF_NAME, cf_opts)];

        let db = if read_only {
            let mut secondary_path = path.clone();
            secondary_path.push("secondary");
            DB::open_cf_descriptors_as_secondary(&db_opts, path, secondary_path, cfs)?
        } else {
            DB::open_cf_descriptors(&db_opts, path, cfs)?
        };

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self) -> &ColumnFamily {
        self.db.cf_handle(TAPESTRY_CF_NAME).expect("cf missing")
    }

    pub fn flush_and_compact(&self) -> Result<(), Error> {
        self.db.flush()?;
        self.db
            .compact_range_cf(self.cf(), None::<Vec<u8>>, None::<Vec<u8>>);

        Ok(())
    }
}

fn member_key(key: &str, member: &str) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&MEMBER_SCORE)
        .append(key)
        .append_raw(member.as_bytes())
        .build()
}

fn score_prefix(key: &str) -> Vec<u8> {
    EncodeBuilder::new().append(&SCORE_INDEX).append(key).build()
}

fn score_key(key: &str, score: Score, member: &str) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&SCORE_INDEX)
        .append(key)
        .append(&VarUInt::from(score))
        .append_raw(member.as_bytes())
        .build()
}

fn txo_key(outpoint: &Outpoint) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&TXO)
        .append(&outpoint.txid.to_byte_array())
        .append(&outpoint.vout)
        .build()
}

fn data_prefix(outpoint: &Outpoint) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&TXO_DATA)
        .append(&outpoint.txid.to_byte_array())
        .append(&outpoint.vout)
        .build()
}

fn data_key(outpoint: &Outpoint, tag: &str) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&TXO_DATA)
        .append(&outpoint.txid.to_byte_array())
        .append(&outpoint.vout)
        .append_raw(tag.as_bytes())
        .build()
}

fn spend_key(outpoint: &Outpoint) -> Vec<u8> {
    EncodeBuilder::new()
        .append(&SPEND)
        .append(&outpoint.txid.to_byte_array())
        .append(&outpoint.vout)
        .build()
}

fn decode_score_row(prefix_len: usize, raw: &[u8]) -> Result<LogEntry, Error> {
    let (score, member) = VarUInt::decode(&raw[prefix_len..])?;

    Ok(LogEntry {
        member: String::from_utf8(member.to_vec())
            .map_err(crate::storage::encdec::DecodingError::from)?,
        score: score.try_into()?,
    })
}

/// Immediate lexicographic successor of a key.
fn successor(mut key: Vec<u8>) -> Vec<u8> {
    key.push(0x00);
    key
}

#[async_trait]
impl EventLogStore for RocksStore {
    async fn log(&self, key: &str, member: &str, score: Score) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        let cf = self.cf();

        let mk = member_key(key, member);
        let mut wb = WriteBatch::default();

        if let Some(bytes) = self.db.get_cf(cf, &mk)? {
            let previous = Score::decode_all(&bytes)?;
            if previous == score {
                return Ok(());
            }
            wb.delete_cf(cf, score_key(key, previous, member));
        }

        wb.put_cf(cf, score_key(key, score, member), []);
        wb.put_cf(cf, mk, score.encode());

        self.db.write(wb)?;
        Ok(())
    }

    async fn log_once(&self, key: &str, member: &str, score: Score) -> Result<bool, Error> {
        let _guard = self.write_lock.lock().unwrap();
        let cf = self.cf();

        let mk = member_key(key, member);
        if self.db.get_cf(cf, &mk)?.is_some() {
            return Ok(false);
        }

        let mut wb = WriteBatch::default();
        wb.put_cf(cf, score_key(key, score, member), []);
        wb.put_cf(cf, mk, score.encode());

        self.db.write(wb)?;
        Ok(true)
    }

    async fn delog(&self, key: &str, members: &[String]) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        let cf = self.cf();

        let mut wb = WriteBatch::default();

        for member in members {
            let mk = member_key(key, member);
            if let Some(bytes) = self.db.get_cf(cf, &mk)? {
                let score = Score::decode_all(&bytes)?;
                wb.delete_cf(cf, score_key(key, score, member));
                wb.delete_cf(cf, mk);
            }
        }

        self.db.write(wb)?;
        Ok(())
    }

    async fn log_score(&self, key: &str, member: &str) -> Result<Option<Score>, Error> {
        match self.db.get_cf(self.cf(), member_key(key, member))? {
            Some(bytes) => Ok(Some(Score::decode_all(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn range(
        &self,
        key: &str,
        from: Score,
        to: Score,
        reverse: bool,
        after: Option<&LogEntry>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, Error> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let prefix = score_prefix(key);

        let mut lower = [prefix.as_slice(), &VarUInt::from(from).encode()].concat();
        let mut upper = [prefix.as_slice(), &VarUInt::from(to).encode()].concat();

        if let Some(entry) = after {
            let position = score_key(key, entry.score, &entry.member);
            if reverse {
                upper = position;
            } else {
                lower = successor(position);
            }
        }

        if lower >= upper {
            return Ok(Vec::new());
        }

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(lower..upper);

        let mode = if reverse {
            IteratorMode::End
        } else {
            IteratorMode::Start
        };

        let mut out = Vec::with_capacity(limit.min(1024));

        for kv in self.db.iterator_cf_opt(self.cf(), read_opts, mode) {
            let (raw_key, _) = kv?;
            out.push(decode_score_row(prefix.len(), &raw_key)?);

            if out.len() >= limit {
                break;
            }
        }

        Ok(out)
    }

    async fn get_spend(&self, outpoint: &Outpoint) -> Result<Option<Txid>, Error> {
        match self.db.get_cf(self.cf(), spend_key(outpoint))? {
            Some(bytes) => Ok(Some(Txid::from_byte_array(<[u8; 32]>::decode_all(&bytes)?))),
            None => Ok(None),
        }
    }

    async fn get_spends(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<Txid>>, Error> {
        let cf = self.cf();
        let keys = outpoints.iter().map(|outpoint| (cf, spend_key(outpoint)));

        let mut out = Vec::with_capacity(outpoints.len());
        for res in self.db.multi_get_cf(keys) {
            out.push(match res? {
                Some(bytes) => Some(Txid::from_byte_array(<[u8; 32]>::decode_all(&bytes)?)),
                None => None,
            });
        }

        Ok(out)
    }

    async fn set_new_spend(&self, outpoint: &Outpoint, spend: &Txid) -> Result<bool, Error> {
        let _guard = self.write_lock.lock().unwrap();
        let cf = self.cf();

        let key = spend_key(outpoint);
        if let Some(bytes) = self.db.get_cf(cf, &key)? {
            let existing = Txid::from_byte_array(<[u8; 32]>::decode_all(&bytes)?);
            return Ok(existing == *spend);
        }

        self.db.put_cf(cf, key, spend.to_byte_array())?;
        Ok(true)
    }

    async fn unset_spends(&self, outpoints: &[Outpoint]) -> Result<(), Error> {
        let cf = self.cf();

        let mut wb = WriteBatch::default();
        for outpoint in outpoints {
            wb.delete_cf(cf, spend_key(outpoint));
        }

        self.db.write(wb)?;
        Ok(())
    }

    async fn put_txo(&self, record: &TxoRecord) -> Result<(), Error> {
        self.db
            .put_cf(self.cf(), txo_key(&record.outpoint), serde_json::to_vec(record)?)?;
        Ok(())
    }

    async fn get_txo(&self, outpoint: &Outpoint) -> Result<Option<TxoRecord>, Error> {
        match self.db.get_cf(self.cf(), txo_key(outpoint))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_txos(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<TxoRecord>>, Error> {
        let cf = self.cf();
        let keys = outpoints.iter().map(|outpoint| (cf, txo_key(outpoint)));

        let mut out = Vec::with_capacity(outpoints.len());
        for res in self.db.multi_get_cf(keys) {
            out.push(match res? {
                Some(bytes) => Some(serde_json::from_slice(&bytes)?),
                None => None,
            });
        }

        Ok(out)
    }

    async fn delete_txo(&self, outpoint: &Outpoint) -> Result<(), Error> {
        self.db.delete_cf(self.cf(), txo_key(outpoint))?;
        Ok(())
    }

    async fn put_data(&self, outpoint: &Outpoint, tag: &str, data: &[u8]) -> Result<(), Error> {
        self.db.put_cf(self.cf(), data_key(outpoint, tag), data)?;
        Ok(())
    }

    async fn get_data(&self, outpoint: &Outpoint, tag: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .db
            .get_cf(self.cf(), data_key(outpoint, tag))?
            .map(|bytes| bytes.to_vec()))
    }

    async fn get_all_data(&self, outpoint: &Outpoint) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let prefix = data_prefix(outpoint);
        let range = prefix_key_range(&prefix);

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(range);

        let mut out = Vec::new();

        for kv in self
            .db
            .iterator_cf_opt(self.cf(), read_opts, IteratorMode::Start)
        {
            let (raw_key, value) = kv?;
            let tag = String::from_utf8(raw_key[prefix.len()..].to_vec())
                .map_err(crate::storage::encdec::DecodingError::from)?;

            out.push((tag, value.to_vec()));
        }

        Ok(out)
    }

    async fn delete_data(&self, outpoint: &Outpoint, tag: &str) -> Result<(), Error> {
        self.db.delete_cf(self.cf(), data_key(outpoint, tag))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().to_path_buf(), false, 64 * 1024 * 1024).unwrap();
        (dir, store)
    }

    fn txid(seed: u8) -> Txid {
        Txid::from_byte_array([seed; 32])
    }

    #[tokio::test]
    async fn log_range_and_delog() {
        let (_dir, store) = open_temp();

        store.log("own:a", "m1", 100_000_000_000).await.unwrap();
        store.log("own:a", "m2", 100_000_000_001).await.unwrap();
        store.log("own:a", "m1", 200_000_000_000).await.unwrap();

        assert_eq!(
            store.log_score("own:a", "m1").await.unwrap(),
            Some(200_000_000_000)
        );

        let entries = store
            .range("own:a", 0, u64::MAX, false, None, 10)
            .await
            .unwrap();
        let members: Vec<_> = entries.iter().map(|e| e.member.as_str()).collect();
        assert_eq!(members, vec!["m2", "m1"]);

        let reversed = store
            .range("own:a", 0, u64::MAX, true, None, 10)
            .await
            .unwrap();
        assert_eq!(reversed[0].member, "m1");

        store.delog("own:a", &["m1".to_string()]).await.unwrap();
        assert_eq!(store.log_score("own:a", "m1").await.unwrap(), None);

        let entries = store
            .range("own:a", 0, u64::MAX, false, None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn range_resumes_after_cursor() {
        let (_dir, store) = open_temp();

        for n in 0..10u64 {
            store.log("k", &format!("m{n}"), 100 + n).await.unwrap();
        }

        let first = store.range("k", 0, u64::MAX, false, None, 4).await.unwrap();
        assert_eq!(first.len(), 4);

        let second = store
            .range("k", 0, u64::MAX, false, first.last(), 100)
            .await
            .unwrap();
        assert_eq!(second.len(), 6);
        assert_eq!(second[0].member, "m4");
    }

    #[tokio::test]
    async fn spend_claim_and_txo_roundtrip() {
        let (_dir, store) = open_temp();

        let outpoint = Outpoint::new(txid(1), 0);

        assert!(store.set_new_spend(&outpoint, &txid(2)).await.unwrap());
        assert!(!store.set_new_spend(&outpoint, &txid(3)).await.unwrap());
        assert_eq!(store.get_spend(&outpoint).await.unwrap(), Some(txid(2)));

        store.unset_spends(&[outpoint]).await.unwrap();
        assert_eq!(store.get_spend(&outpoint).await.unwrap(), None);

        let record = TxoRecord {
            outpoint,
            height: 5,
            idx: 1,
            satoshis: Some(546),
            owners: ["1addr".to_string()].into(),
        };
        store.put_txo(&record).await.unwrap();

        let loaded = store.get_txo(&outpoint).await.unwrap().unwrap();
        assert_eq!(loaded.satoshis, Some(546));

        store.put_data(&outpoint, "insc", b"{}").await.unwrap();
        store.put_data(&outpoint, "origin", b"{}").await.unwrap();

        let all = store.get_all_data(&outpoint).await.unwrap();
        let tags: Vec<_> = all.iter().map(|(tag, _)| tag.as_str()).collect();
        assert_eq!(tags, vec!["insc", "origin"]);
    }
}
