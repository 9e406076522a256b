use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use itertools::Itertools;
use serde::Deserialize;

use crate::error::Error;
use crate::model::{Outpoint, Score, Txo};
use crate::storage::{LogEntry, Store};

/// Page size used against the backend, so a backend never materializes
/// unbounded results regardless of the caller's limit.
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    /// Union of all keys' members.
    #[default]
    Union,
    /// Members present under every key simultaneously.
    Intersect,
}

/// A paginated range query over one or more search keys.
#[derive(Debug, Clone)]
pub struct SearchCfg {
    pub keys: Vec<String>,
    pub from: Option<Score>,
    pub to: Option<Score>,
    pub reverse: bool,
    pub limit: usize,
    pub comb: Combinator,
    /// Drop members whose outpoint already has a recorded spend. Filtering
    /// happens after page-level fetch; pages are refilled until the limit is
    /// met.
    pub filter_spent: bool,
}

impl SearchCfg {
    pub fn key(key: impl Into<String>) -> Self {
        Self::keys(vec![key.into()])
    }

    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys,
            from: None,
            to: None,
            reverse: false,
            limit: PAGE_SIZE,
            comb: Combinator::Union,
            filter_spent: false,
        }
    }

    pub fn range(mut self, from: Option<Score>, to: Option<Score>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn comb(mut self, comb: Combinator) -> Self {
        self.comb = comb;
        self
    }

    pub fn filter_spent(mut self, filter_spent: bool) -> Self {
        self.filter_spent = filter_spent;
        self
    }
}

/// An independently paginated, score-ordered cursor over one key.
struct Cursor<'a> {
    store: &'a Store,
    key: String,
    from: Score,
    to: Score,
    reverse: bool,
    page: VecDeque<LogEntry>,
    last: Option<LogEntry>,
    exhausted: bool,
}

impl<'a> Cursor<'a> {
    fn new(store: &'a Store, key: String, from: Score, to: Score, reverse: bool) -> Self {
        Self {
            store,
            key,
            from,
            to,
            reverse,
            page: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }

    /// Ensure the head is loaded, fetching the next backend page if needed.
    async fn fill(&mut self) -> Result<(), Error> {
        if !self.page.is_empty() || self.exhausted {
            return Ok(());
        }

        let entries = self
            .store
            .range(
                &self.key,
                self.from,
                self.to,
                self.reverse,
                self.last.as_ref(),
                PAGE_SIZE,
            )
            .await?;

        if entries.len() < PAGE_SIZE {
            self.exhausted = true;
        }

        self.last = entries.last().cloned();
        self.page = entries.into();

        Ok(())
    }

    fn head(&self) -> Option<&LogEntry> {
        self.page.front()
    }

    fn pop(&mut self) -> Option<LogEntry> {
        self.page.pop_front()
    }
}

/// Merge-order rank of an entry: `(score, member)`, ascending. Descending
/// searches flip the comparison at the call sites.
fn rank(entry: &LogEntry) -> (Score, &str) {
    (entry.score, entry.member.as_str())
}

/// Search one or more keys, merging score-ordered cursors. An empty key list
/// yields an empty result, never an error.
pub async fn search(store: &Store, cfg: &SearchCfg) -> Result<Vec<LogEntry>, Error> {
    if cfg.keys.is_empty() || cfg.limit == 0 {
        return Ok(Vec::new());
    }

    let from = cfg.from.unwrap_or(0);
    let to = cfg.to.unwrap_or(u64::MAX);

    let mut cursors: Vec<Cursor> = cfg
        .keys
        .iter()
        .map(|key| Cursor::new(store, key.clone(), from, to, cfg.reverse))
        .collect();

    let mut out: Vec<LogEntry> = Vec::new();
    // candidates held back until a page is assembled, for batch spend checks
    let mut pending: Vec<LogEntry> = Vec::new();
    let mut emitted: HashSet<(Score, String)> = HashSet::new();

    loop {
        let candidate = match cfg.comb {
            Combinator::Union => next_union(&mut cursors, cfg.reverse, &mut emitted).await?,
            Combinator::Intersect => next_intersect(&mut cursors, cfg.reverse).await?,
        };

        let drained = candidate.is_none();
        if let Some(entry) = candidate {
            pending.push(entry);
        }

        if pending.len() >= PAGE_SIZE || drained {
            let page = std::mem::take(&mut pending);
            let page = if cfg.filter_spent {
                drop_spent(store, page).await?
            } else {
                page
            };

            for entry in page {
                out.push(entry);
                if out.len() >= cfg.limit {
                    return Ok(out);
                }
            }
        }

        if drained {
            return Ok(out);
        }
    }
}

/// Pop the cursor head with the extreme score. Entries identical in
/// `(member, score)` across keys are emitted once; the same member at
/// different scores is emitted once per score.
async fn next_union(
    cursors: &mut [Cursor<'_>],
    reverse: bool,
    emitted: &mut HashSet<(Score, String)>,
) -> Result<Option<LogEntry>, Error> {
    loop {
        for cursor in cursors.iter_mut() {
            cursor.fill().await?;
        }

        let mut best: Option<usize> = None;

        for (i, cursor) in cursors.iter().enumerate() {
            let Some(head) = cursor.head() else { continue };

            best = Some(match best {
                None => i,
                Some(j) => {
                    let current = rank(cursors[j].head().unwrap());
                    let ahead = if reverse {
                        rank(head) > current
                    } else {
                        rank(head) < current
                    };
                    if ahead { i } else { j }
                }
            });
        }

        let Some(best) = best else { return Ok(None) };
        let entry = cursors[best].pop().unwrap();

        if emitted.insert((entry.score, entry.member.clone())) {
            return Ok(Some(entry));
        }
    }
}

/// Emit a member only when it heads every cursor simultaneously, reporting
/// the minimum score across keys; otherwise advance the cursors that are
/// behind and retry.
async fn next_intersect(
    cursors: &mut [Cursor<'_>],
    reverse: bool,
) -> Result<Option<LogEntry>, Error> {
    loop {
        for cursor in cursors.iter_mut() {
            cursor.fill().await?;
        }

        // any exhausted key ends the intersection
        if cursors.iter().any(|cursor| cursor.head().is_none()) {
            return Ok(None);
        }

        let first = cursors[0].head().unwrap().member.clone();
        let aligned = cursors
            .iter()
            .all(|cursor| cursor.head().unwrap().member == first);

        if aligned {
            let score = cursors
                .iter()
                .map(|cursor| cursor.head().unwrap().score)
                .min()
                .unwrap();

            for cursor in cursors.iter_mut() {
                cursor.pop();
            }

            return Ok(Some(LogEntry {
                member: first,
                score,
            }));
        }

        // advance every cursor strictly behind the furthest head
        let extreme = {
            let ranks = cursors.iter().map(|cursor| rank(cursor.head().unwrap()));
            let extreme = if reverse {
                ranks.min().unwrap()
            } else {
                ranks.max().unwrap()
            };
            (extreme.0, extreme.1.to_string())
        };

        for cursor in cursors.iter_mut() {
            let behind = {
                let head = cursor.head().unwrap();
                let head_rank = (head.score, head.member.as_str());
                let extreme_rank = (extreme.0, extreme.1.as_str());
                if reverse {
                    head_rank > extreme_rank
                } else {
                    head_rank < extreme_rank
                }
            };

            if behind {
                cursor.pop();
            }
        }
    }
}

async fn drop_spent(store: &Store, entries: Vec<LogEntry>) -> Result<Vec<LogEntry>, Error> {
    let outpoints: Vec<Outpoint> = entries
        .iter()
        .filter_map(|entry| Outpoint::from_str(&entry.member).ok())
        .collect();

    let spends = store.get_spends(&outpoints).await?;

    let spent: HashSet<String> = outpoints
        .iter()
        .zip_eq(spends)
        .filter_map(|(outpoint, spend)| spend.map(|_| outpoint.to_string()))
        .collect();

    Ok(entries
        .into_iter()
        .filter(|entry| !spent.contains(&entry.member))
        .collect())
}

/// Search and hydrate the matching outputs. Members that don't parse as
/// outpoints or have no stored record are skipped.
pub async fn search_txos(store: &Store, cfg: &SearchCfg) -> Result<Vec<Txo>, Error> {
    let entries = search(store, cfg).await?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Ok(outpoint) = Outpoint::from_str(&entry.member) else {
            continue;
        };
        if let Some(txo) = store.load_txo(&outpoint).await? {
            out.push(txo);
        }
    }

    Ok(out)
}

/// Sum the satoshis of the unspent outputs under the given keys.
pub async fn search_balance(store: &Store, keys: Vec<String>) -> Result<u64, Error> {
    let cfg = SearchCfg::keys(keys).limit(usize::MAX).filter_spent(true);
    let entries = search(store, &cfg).await?;

    let outpoints: Vec<Outpoint> = entries
        .iter()
        .filter_map(|entry| Outpoint::from_str(&entry.member).ok())
        .collect();

    let records = store.get_txos(&outpoints).await?;

    Ok(records
        .into_iter()
        .flatten()
        .filter_map(|record| record.satoshis)
        .sum())
}
