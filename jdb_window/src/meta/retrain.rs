//! Global relayout of every segment across partitions
//! 所有段跨分区的全局重新布局

#![allow(
  clippy::cast_precision_loss,
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap,
  clippy::cast_sign_loss
)]

use std::ops::DerefMut;

use super::Part;
use crate::{
  Key, SearchBound, Segment, Ts,
  model::{MetaModel, fit_runs},
};

/// Read-mostly routing table, rewritten only by a meta retrain
/// 以读为主的路由表，仅由元重训改写
#[derive(Debug)]
pub(crate) struct Route<K> {
  /// First boundary key of each partition / 各分区首个边界键
  pub starts: Vec<K>,
  pub model: MetaModel,
  pub bases: Vec<usize>,
  pub lens: Vec<usize>,
  pub bounds: Vec<(usize, usize)>,
}

impl<K: Key> Route<K> {
  /// Partition 0 also owns everything below its first key
  /// 分区 0 同时拥有其首键以下的所有键
  #[inline]
  pub fn owner(&self, key: K) -> usize {
    self.starts[1..].partition_point(|s| *s <= key)
  }

  /// Search window in partition `p`, possibly stale
  /// 分区 `p` 中的查找窗口，可能已过时
  pub fn bound(&self, p: usize, key: K) -> SearchBound {
    let (left, right) = self.bounds[p];
    SearchBound::new(
      self.model.predict(key.as_f64()) - self.bases[p] as isize,
      left,
      right,
      self.lens[p],
      !self.model.degenerate(),
    )
  }
}

/// Keys kept by a rebuild: live ones, or all of them when fewer live
/// segments remain than partitions
/// 重建保留的键：存活键；存活段少于分区数时保留全部
pub(crate) fn kept_keys<K: Copy>(marked: &[(K, bool)], threads: usize) -> Vec<K> {
  let live = marked.iter().filter(|(_, live)| *live).count();
  marked
    .iter()
    .filter(|(_, l)| *l || live < threads)
    .map(|(k, _)| *k)
    .collect()
}

/// Place `segs` (key order, at least `threads`) by `model` and split them
/// evenly into `threads` partitions
/// 按 `model` 放置 `segs`（键序，至少 `threads` 个）并均分为 `threads` 个分区
pub(crate) fn layout<K: Key, T: Ts>(
  segs: Vec<Segment<K, T>>,
  model: MetaModel,
  threads: usize,
) -> (Vec<Part<K, T>>, Route<K>) {
  let n = segs.len();
  debug_assert!(n >= threads && threads > 0);
  let keys: Vec<K> = segs.iter().map(Segment::key_start).collect();

  // first segment lands on slot 0
  let offset = model.predict(keys[0].as_f64());
  let model = MetaModel {
    intercept: model.intercept - offset as f64,
    ..model
  };
  let mut pos = Vec::with_capacity(n);
  let mut next = 0isize;
  for k in &keys {
    let p = model.predict(k.as_f64()).max(next);
    pos.push(p as usize);
    next = p + 1;
  }
  let total = next as usize;

  let firsts: Vec<usize> = (0..=threads).map(|t| t * n / threads).collect();
  let mut segs = segs.into_iter();
  let mut parts = Vec::with_capacity(threads);
  for t in 0..threads {
    let (a, b) = (firsts[t], firsts[t + 1]);
    let base = pos[a];
    let end = if b < n { pos[b] } else { total };
    let placed = segs
      .by_ref()
      .take(b - a)
      .zip(&pos[a..b])
      .map(|(s, &p)| (p - base, s));
    parts.push(Part::new(
      t,
      base,
      (t > 0).then(|| keys[a]),
      (b < n).then(|| keys[b]),
      end - base,
      model,
      placed,
    ));
  }

  let route = Route {
    starts: firsts[..threads].iter().map(|&a| keys[a]).collect(),
    model,
    bases: parts.iter().map(|p| p.base).collect(),
    lens: parts.iter().map(Part::len).collect(),
    bounds: parts.iter().map(Part::bounds).collect(),
  };
  (parts, route)
}

/// Rebuild every partition in place. Callers hold all partition locks.
/// Watermarks, frozen flags and queued inserts survive the rebuild.
///
/// 原地重建所有分区，调用方持有全部分区锁。水位线、冻结标志与排队插入在重建后保留。
pub(crate) fn rebuild<K, T, P>(parts: &mut [P], model: MetaModel, expiry: T, eps: usize) -> Route<K>
where
  K: Key,
  T: Ts,
  P: DerefMut<Target = Part<K, T>>,
{
  let threads = parts.len();
  let mut segs: Vec<Segment<K, T>> = Vec::new();
  for mut seg in parts.iter_mut().flat_map(|p| p.drain_segments()) {
    // a former first segment may hold keys below its boundary; refit it so
    // the boundary is its smallest key again
    if seg.min_key() < seg.key_start() && !seg.is_expired(expiry) {
      let entries = seg.merge_data(expiry);
      if !entries.is_empty() {
        for run in fit_runs(&entries, eps, 1) {
          segs.push(Segment::new(&entries[run.range], run.cone, eps));
        }
        continue;
      }
    }
    segs.push(seg);
  }
  if segs.iter().filter(|s| !s.is_expired(expiry)).count() >= threads {
    segs.retain(|s| !s.is_expired(expiry));
  }
  let (fresh, route) = layout(segs, model, threads);
  for (old, mut new) in parts.iter_mut().zip(fresh) {
    new.watermark = old.watermark;
    new.frozen = old.frozen;
    new.queued = std::mem::take(&mut old.queued);
    **old = new;
  }
  route
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Entry, model::Cone};

  fn segs(keys: &[u64]) -> Vec<Segment<u64, u64>> {
    keys
      .iter()
      .map(|&k| Segment::new(&[Entry::new(k, 1)], Cone::new(4), 4))
      .collect()
  }

  #[test]
  fn even_split() {
    let keys: Vec<u64> = (0..10).map(|i| i * 100).collect();
    let model = MetaModel::fit(&keys, 0.7);
    let (parts, route) = layout(segs(&keys), model, 3);
    assert_eq!(parts.iter().map(Part::seg_count).collect::<Vec<_>>(), [3, 3, 4]);
    assert_eq!(route.starts, [0, 300, 600]);
    assert_eq!(route.owner(0), 0);
    assert_eq!(route.owner(299), 0);
    assert_eq!(route.owner(300), 1);
    assert_eq!(route.owner(u64::MAX), 2);
    for (t, p) in parts.iter().enumerate() {
      p.verify().unwrap();
      assert_eq!(p.base, route.bases[t]);
    }
    // slices tile the global array
    for w in parts.windows(2) {
      assert_eq!(w[0].base + w[0].len(), w[1].base);
    }
  }

  #[test]
  fn clustered_keys_still_ordered() {
    let keys = [1u64, 2, 3, 4, 1_000_000, 1_000_001];
    let model = MetaModel::fit(&keys, 0.7);
    let (parts, _) = layout(segs(&keys), model, 2);
    for p in &parts {
      p.verify().unwrap();
    }
  }

  #[test]
  fn keep_all_when_too_few_live() {
    let marked = [(1, false), (2, true), (3, false)];
    assert_eq!(kept_keys(&marked, 2), [1, 2, 3]);
    assert_eq!(kept_keys(&marked, 1), [2]);
  }
}
