//! Shared index state and its locking protocol
//! 共享索引状态及其加锁协议
//!
//! Every partition sits behind its own mutex. Operations spanning several
//! partitions lock them in ascending order. A meta retrain first marks every
//! partition frozen (readers wait, inserts queue), then takes all locks at
//! once to rebuild, drains the queued inserts and wakes the waiters.
//!
//! 每个分区由各自的互斥锁保护。跨分区操作按升序加锁。元重训先将所有分区标记为
//! 冻结（读者等待，插入排队），再一次性持有全部锁重建，回放排队的插入并唤醒等待者。

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::{
  Conf, Entry, Key, SearchBound, Ts,
  conf::{EXTEND_FACTOR, RETRAIN_DENSITY},
  meta::{Part, RetrainKind, Route, kept_keys, rebuild},
  model::MetaModel,
  stats::{Stats, bump},
};

#[derive(Debug)]
pub(crate) struct Slice<K, T> {
  state: Mutex<Part<K, T>>,
  thawed: Condvar,
}

/// Everything an operation needs, shared by workers and the coordinator
/// 操作所需的全部状态，由工作线程与协调者共享
#[derive(Debug)]
pub struct IndexContext<K, T> {
  pub(crate) conf: Conf,
  slices: Box<[Slice<K, T>]>,
  pub(crate) route: RwLock<Route<K>>,
  pub(crate) stats: Stats,
  retraining: AtomicBool,
}

impl<K: Key, T: Ts> IndexContext<K, T> {
  pub(crate) fn new(conf: Conf, parts: Vec<Part<K, T>>, route: Route<K>) -> Self {
    Self {
      conf,
      slices: parts
        .into_iter()
        .map(|p| Slice {
          state: Mutex::new(p),
          thawed: Condvar::new(),
        })
        .collect(),
      route: RwLock::new(route),
      stats: Stats::default(),
      retraining: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn conf(&self) -> &Conf {
    &self.conf
  }

  /// Partition owning `key` per the current route
  /// 按当前路由拥有 `key` 的分区
  #[inline]
  pub fn owner(&self, key: K) -> usize {
    self.route.read().owner(key)
  }

  #[inline]
  pub fn retraining(&self) -> bool {
    self.retraining.load(Ordering::Acquire)
  }

  /// Lock partition `p`, waiting out a meta retrain
  /// 锁定分区 `p`，等待元重训结束
  pub(crate) fn enter(&self, p: usize) -> MutexGuard<'_, Part<K, T>> {
    let slice = &self.slices[p];
    let mut g = slice.state.lock();
    while g.frozen {
      slice.thawed.wait(&mut g);
    }
    g
  }

  /// Lock every partition, ascending
  /// 按升序锁定所有分区
  pub(crate) fn enter_all(&self) -> Vec<MutexGuard<'_, Part<K, T>>> {
    (0..self.slices.len()).map(|p| self.enter(p)).collect()
  }

  /// Returns (found, meta retrain wanted)
  /// 返回 (是否找到, 是否需要元重训)
  pub(crate) fn lookup(&self, key: K, now: T, hint: Option<(usize, SearchBound)>) -> (bool, bool) {
    let expiry = now.expiry(self.conf.window);
    loop {
      let p = self.owner(key);
      let mut g = self.enter(p);
      if !g.owns(key) {
        continue;
      }
      let hint = hint.filter(|(t, _)| *t == p).map(|(_, b)| b);
      let found = g.lookup(key, expiry, hint, &self.conf, &self.stats);
      return (found, g.retrain_kind(&self.conf).is_some());
    }
  }

  /// Live entries in `[lo, hi]` sorted by key, plus whether a meta retrain
  /// is wanted
  /// `[lo, hi]` 内按键排序的存活条目，以及是否需要元重训
  pub(crate) fn range(&self, lo: K, hi: K, now: T) -> (Vec<Entry<K, T>>, bool) {
    let expiry = now.expiry(self.conf.window);
    loop {
      let (a, b) = {
        let r = self.route.read();
        (r.owner(lo), r.owner(hi))
      };
      let mut guards: Vec<_> = (a..=b).map(|p| self.enter(p)).collect();
      let stale = !guards[0].owns(lo) || !guards.last().is_some_and(|g| g.owns(hi));
      if stale {
        continue;
      }
      let mut out = Vec::new();
      for g in &mut guards {
        g.range(lo, hi, expiry, &mut out, &self.conf, &self.stats);
      }
      let retrain = guards.iter().any(|g| g.retrain_kind(&self.conf).is_some());
      return (out, retrain);
    }
  }

  /// Insert into whichever partition owns `e.key` now. While a meta retrain
  /// runs the entry is queued and applied when it finishes. Returns whether a
  /// meta retrain is wanted.
  ///
  /// 插入当前拥有 `e.key` 的分区。元重训期间条目排队，结束后再应用。返回是否需要元重训。
  pub fn insert(&self, e: Entry<K, T>) -> bool {
    loop {
      let p = self.owner(e.key);
      let mut g = self.slices[p].state.lock();
      if g.frozen {
        g.queued.push(e);
        bump(&self.stats.queued);
        return false;
      }
      if !g.owns(e.key) {
        continue;
      }
      g.insert(e, &self.conf, &self.stats);
      return g.retrain_kind(&self.conf).is_some();
    }
  }

  /// Rebuild the meta array if any partition still asks for it. Concurrent
  /// callers return at once, the running retrain covers them.
  ///
  /// 若仍有分区需要则重建元数组。并发调用者立即返回，由正在运行的重训覆盖。
  pub fn meta_retrain(&self) {
    if self.retraining.swap(true, Ordering::AcqRel) {
      return;
    }

    // freeze ascending, snapshot boundary keys
    let mut kind = None;
    let mut watermark = T::ZERO;
    let mut snap = Vec::new();
    for s in self.slices.iter() {
      let mut g = s.state.lock();
      g.frozen = true;
      kind = kind.max(g.retrain_kind(&self.conf));
      watermark = watermark.max(g.watermark);
      snap.extend(g.chain().map(|seg| (seg.key_start(), seg.max_ts())));
    }
    let expiry = watermark.expiry(self.conf.window);

    let model = match kind {
      Some(RetrainKind::Full) => {
        let marked: Vec<(K, bool)> = snap.iter().map(|&(k, ts)| (k, ts >= expiry)).collect();
        Some(MetaModel::fit(
          &kept_keys(&marked, self.slices.len()),
          RETRAIN_DENSITY,
        ))
      }
      Some(RetrainKind::Extend) => Some(self.route.read().model.extend(EXTEND_FACTOR)),
      None => None,
    };

    let mut guards: Vec<_> = self.slices.iter().map(|s| s.state.lock()).collect();
    if let Some(model) = model {
      let route = rebuild(&mut guards, model, expiry, self.conf.error);
      *self.route.write() = route;
      match kind {
        Some(RetrainKind::Full) => bump(&self.stats.meta_fulls),
        _ => bump(&self.stats.meta_extends),
      }
      info!(
        "meta retrain {kind:?}: {} segments over {} partitions",
        guards.iter().map(|g| g.seg_count()).sum::<usize>(),
        guards.len()
      );
    }

    let queued: Vec<Entry<K, T>> = guards
      .iter_mut()
      .flat_map(|g| {
        g.frozen = false;
        std::mem::take(&mut g.queued)
      })
      .collect();
    if !queued.is_empty() {
      debug!("meta retrain: replay {} queued inserts", queued.len());
      let route = self.route.read();
      for e in queued {
        guards[route.owner(e.key)].insert(e, &self.conf, &self.stats);
      }
    }
    drop(guards);

    self.retraining.store(false, Ordering::Release);
    for s in self.slices.iter() {
      s.thawed.notify_all();
    }
  }

  pub(crate) fn threads(&self) -> usize {
    self.slices.len()
  }
}
