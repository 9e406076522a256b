use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::Error;
use crate::model::{Outpoint, Score};

use super::event_log::{EventLogStore, LogEntry, TxoRecord};

/// In-memory backend. All data is lost when the process exits; used for
/// tests and short-lived pipelines that don't need persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// `(key, member) -> score`, the uniqueness constraint.
    scores: HashMap<String, HashMap<String, Score>>,
    /// Score-ordered view of the same entries.
    ordered: HashMap<String, BTreeSet<(Score, String)>>,
    spends: HashMap<Outpoint, Txid>,
    txos: HashMap<Outpoint, TxoRecord>,
    data: HashMap<Outpoint, BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn upsert(&mut self, key: &str, member: &str, score: Score) {
        let members = self.scores.entry(key.to_string()).or_default();
        let ordered = self.ordered.entry(key.to_string()).or_default();

        if let Some(previous) = members.insert(member.to_string(), score) {
            ordered.remove(&(previous, member.to_string()));
        }
        ordered.insert((score, member.to_string()));
    }
}

#[async_trait]
impl EventLogStore for MemoryStore {
    async fn log(&self, key: &str, member: &str, score: Score) -> Result<(), Error> {
        self.inner.write().unwrap().upsert(key, member, score);
        Ok(())
    }

    async fn log_once(&self, key: &str, member: &str, score: Score) -> Result<bool, Error> {
        let mut inner = self.inner.write().unwrap();

        if let Some(members) = inner.scores.get(key) {
            if members.contains_key(member) {
                return Ok(false);
            }
        }

        inner.upsert(key, member, score);
        Ok(true)
    }

    async fn delog(&self, key: &str, members: &[String]) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();

        for member in members {
            let Some(scores) = inner.scores.get_mut(key) else {
                return Ok(());
            };

            if let Some(score) = scores.remove(member) {
                if let Some(ordered) = inner.ordered.get_mut(key) {
                    ordered.remove(&(score, member.clone()));
                }
            }
        }

        Ok(())
    }

    async fn log_score(&self, key: &str, member: &str) -> Result<Option<Score>, Error> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .scores
            .get(key)
            .and_then(|members| members.get(member))
            .copied())
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
        let inner = self.inner.read().unwrap();

        let Some(ordered) = inner.ordered.get(key) else {
            return Ok(Vec::new());
        };

        let lower = Bound::Included((from, String::new()));
        let upper = Bound::Excluded((to, String::new()));

        let entries: Vec<LogEntry> = if reverse {
            let upper = match after {
                Some(entry) => Bound::Excluded((entry.score, entry.member.clone())),
                None => upper,
            };
            ordered
                .range((lower, upper))
                .rev()
                .take(limit)
                .map(|(score, member)| LogEntry {
                    member: member.clone(),
                    score: *score,
                })
                .collect()
        } else {
            let lower = match after {
                Some(entry) => Bound::Excluded((entry.score, entry.member.clone())),
                None => lower,
            };
            ordered
                .range((lower, upper))
                .take(limit)
                .map(|(score, member)| LogEntry {
                    member: member.clone(),
                    score: *score,
                })
                .collect()
        };

        Ok(entries)
    }

    async fn get_spend(&self, outpoint: &Outpoint) -> Result<Option<Txid>, Error> {
        Ok(self.inner.read().unwrap().spends.get(outpoint).copied())
    }

    async fn get_spends(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<Txid>>, Error> {
        let inner = self.inner.read().unwrap();
        Ok(outpoints
            .iter()
            .map(|outpoint| inner.spends.get(outpoint).copied())
            .collect())
    }

    async fn set_new_spend(&self, outpoint: &Outpoint, spend: &Txid) -> Result<bool, Error> {
        let mut inner = self.inner.write().unwrap();

        match inner.spends.get(outpoint) {
            Some(existing) => Ok(existing == spend),
            None => {
                inner.spends.insert(*outpoint, *spend);
                Ok(true)
            }
        }
    }

    async fn unset_spends(&self, outpoints: &[Outpoint]) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        for outpoint in outpoints {
            inner.spends.remove(outpoint);
        }
        Ok(())
    }

    async fn put_txo(&self, record: &TxoRecord) -> Result<(), Error> {
        self.inner
            .write()
            .unwrap()
            .txos
            .insert(record.outpoint, record.clone());
        Ok(())
    }

    async fn get_txo(&self, outpoint: &Outpoint) -> Result<Option<TxoRecord>, Error> {
        Ok(self.inner.read().unwrap().txos.get(outpoint).cloned())
    }

    async fn get_txos(&self, outpoints: &[Outpoint]) -> Result<Vec<Option<TxoRecord>>, Error> {
        let inner = self.inner.read().unwrap();
        Ok(outpoints
            .iter()
            .map(|outpoint| inner.txos.get(outpoint).cloned())
            .collect())
    }

    async fn delete_txo(&self, outpoint: &Outpoint) -> Result<(), Error> {
        self.inner.write().unwrap().txos.remove(outpoint);
        Ok(())
    }

    async fn put_data(&self, outpoint: &Outpoint, tag: &str, data: &[u8]) -> Result<(), Error> {
        self.inner
            .write()
            .unwrap()
            .data
            .entry(*outpoint)
            .or_default()
            .insert(tag.to_string(), data.to_vec());
        Ok(())
    }

    async fn get_data(&self, outpoint: &Outpoint, tag: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .data
            .get(outpoint)
            .and_then(|tags| tags.get(tag))
            .cloned())
    }

    async fn get_all_data(&self, outpoint: &Outpoint) -> Result<Vec<(String, Vec<u8>)>, Error> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .data
            .get(outpoint)
            .map(|tags| {
                tags.iter()
                    .map(|(tag, bytes)| (tag.clone(), bytes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_data(&self, outpoint: &Outpoint, tag: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if let Some(tags) = inner.data.get_mut(outpoint) {
            tags.remove(tag);
            if tags.is_empty() {
                inner.data.remove(outpoint);
            }
        }
        Ok(())
    }
}
