//! Segment: gapped array of entries under a local shrinking-cone model
//! 段：局部收缩锥模型下带空隙的条目数组
//!
//! Entries are never deleted eagerly. A slot whose timestamp fell behind the
//! expiry time is turned into a gap (timestamp `Ts::ZERO`) the first time a
//! lookup, scan or insert touches it, and gaps are reused by later inserts.
//!
//! 条目从不立即删除。时间戳落后于过期时间的槽位在首次被查找、扫描或插入触及时
//! 变为空隙（时间戳 `Ts::ZERO`），空隙可被后续插入复用。

#![allow(
  clippy::cast_precision_loss,
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap,
  clippy::cast_sign_loss
)]

use std::mem::size_of;

use crate::{
  Conf, Entry, Key, SearchBound, Ts,
  arena::SegId,
  conf::{MIN_OCCUPANCY, MIN_SEG_RETRAIN_LEN},
  model::{Cone, Fit},
};

/// Update signal returned to the meta layer
/// 返回给元层的更新信号
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Update<K, T> {
  /// Occupancy fell below half or the buffer overflowed. Repeated by every
  /// operation that finds the segment still degraded.
  /// 占用率低于一半或缓冲溢出。段仍处于退化状态时每次操作都会重复上报。
  Retrain,
  /// Every entry expired. `carry` is an insert the segment refused.
  /// 所有条目已过期。`carry` 为段拒收的插入。
  Delete { carry: Option<Entry<K, T>> },
  /// Key lies beyond what padding can reach: start a new segment
  /// 键超出填充可达范围：新建段
  Split(Entry<K, T>),
}

#[derive(Debug)]
pub struct Segment<K, T> {
  key_start: K,
  data: Vec<Entry<K, T>>,
  buf: Vec<Entry<K, T>>,
  cone: Cone,
  slope: f64,
  left_bound: usize,
  right_bound: usize,
  max_ts: T,
  live: usize,
  flagged: bool,
  pub(crate) left: Option<SegId>,
  pub(crate) right: Option<SegId>,
  pub(crate) parent: usize,
}

impl<K: Key, T: Ts> Segment<K, T> {
  /// Build from a fitted run of live entries (non-empty)
  /// 由拟合好的存活条目段构建（非空）
  pub fn new(data: &[Entry<K, T>], cone: Cone, eps: usize) -> Self {
    debug_assert!(!data.is_empty());
    Self {
      key_start: data[0].key,
      data: data.to_vec(),
      buf: Vec::new(),
      cone,
      slope: cone.slope(),
      left_bound: eps + 1,
      right_bound: eps + 1,
      max_ts: data.iter().map(|e| e.ts).max().unwrap_or(T::ZERO),
      live: data.iter().filter(|e| !e.is_gap()).count(),
      flagged: false,
      left: None,
      right: None,
      parent: 0,
    }
  }

  pub fn single(e: Entry<K, T>, eps: usize) -> Self {
    Self::new(&[e], Cone::new(eps), eps)
  }

  /// Start over around `e`, keeping links
  /// 围绕 `e` 重新开始，保留链接
  pub fn reset(&mut self, e: Entry<K, T>, eps: usize) {
    let (left, right, parent) = (self.left, self.right, self.parent);
    *self = Self::single(e, eps);
    self.left = left;
    self.right = right;
    self.parent = parent;
  }

  #[inline]
  pub fn key_start(&self) -> K {
    self.key_start
  }

  /// Smallest stored key. Only a partition's first segment can hold keys
  /// below `key_start`.
  /// 最小的已存键。只有分区首段可能持有小于 `key_start` 的键。
  pub fn min_key(&self) -> K {
    let d = self.data.first().map(|e| e.key);
    let b = self.buf.first().map(|e| e.key);
    match (d, b) {
      (Some(x), Some(y)) => x.min(y),
      (x, y) => x.or(y).unwrap_or(self.key_start),
    }
  }

  fn max_key(&self) -> K {
    let d = self.data.last().map(|e| e.key);
    let b = self.buf.last().map(|e| e.key);
    d.max(b).unwrap_or(self.key_start)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.data.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.data.is_empty() && self.buf.is_empty()
  }

  /// Non-gap slots in `data` (expired slots count until reclaimed)
  /// `data` 中的非空隙槽位数（过期槽位在回收前仍计入）
  #[inline]
  pub fn live(&self) -> usize {
    self.live
  }

  #[inline]
  pub fn buffer_len(&self) -> usize {
    self.buf.len()
  }

  #[inline]
  pub fn bounds(&self) -> (usize, usize) {
    (self.left_bound, self.right_bound)
  }

  #[inline]
  pub fn max_ts(&self) -> T {
    self.max_ts
  }

  #[inline]
  pub fn is_expired(&self, expiry: T) -> bool {
    self.max_ts < expiry
  }

  #[inline]
  pub fn is_flagged(&self) -> bool {
    self.flagged
  }

  pub fn mem_usage(&self) -> usize {
    size_of::<Self>() + (self.data.capacity() + self.buf.capacity()) * size_of::<Entry<K, T>>()
  }

  #[inline]
  fn predict(&self, key: K) -> isize {
    (self.slope * (key.as_f64() - self.key_start.as_f64())).floor() as isize
  }

  #[inline]
  fn bound(&self, key: K) -> SearchBound {
    SearchBound::new(
      self.predict(key),
      self.left_bound,
      self.right_bound,
      self.data.len(),
      true,
    )
  }

  #[inline]
  fn lower_bound(&self, key: K) -> usize {
    let data = &self.data;
    self
      .bound(key)
      .partition_point(data.len(), |i| data[i].key < key)
  }

  #[inline]
  fn upper_bound(&self, key: K) -> usize {
    let data = &self.data;
    self
      .bound(key)
      .partition_point(data.len(), |i| data[i].key <= key)
  }

  /// True if slot `i` is (or just became) a gap
  /// 槽位 `i` 是（或刚变成）空隙时为真
  #[inline]
  fn reclaim(&mut self, i: usize, expiry: T) -> bool {
    let e = &mut self.data[i];
    if e.is_gap() {
      return true;
    }
    if e.ts < expiry {
      e.ts = T::ZERO;
      self.live -= 1;
      return true;
    }
    false
  }

  fn occupancy(&mut self) -> Option<Update<K, T>> {
    let len = self.data.len();
    if len >= MIN_SEG_RETRAIN_LEN && (self.live as f64) < MIN_OCCUPANCY * len as f64 {
      self.flagged = true;
      return Some(Update::Retrain);
    }
    None
  }

  /// Widen search bounds so slot `pos` is inside the window of `key`
  /// 放宽查找界使 `key` 的窗口包含槽位 `pos`
  #[inline]
  fn widen(&mut self, pos: usize, key: K) {
    let err = pos as isize - self.predict(key);
    if err > 0 {
      self.right_bound = self.right_bound.max(err as usize);
    } else {
      self.left_bound = self.left_bound.max(err.unsigned_abs());
    }
  }

  pub fn lookup(&mut self, key: K, expiry: T) -> (bool, Option<Update<K, T>>) {
    if self.is_expired(expiry) {
      return (false, Some(Update::Delete { carry: None }));
    }
    let mut found = false;
    let mut i = self.lower_bound(key);
    while i < self.data.len() && self.data[i].key == key {
      if !self.reclaim(i, expiry) {
        found = true;
        break;
      }
      i += 1;
    }
    if !found {
      let j = self.buf.partition_point(|e| e.key < key);
      found = self.buf[j..]
        .iter()
        .take_while(|e| e.key == key)
        .any(|e| e.is_live(expiry));
    }
    (found, self.occupancy())
  }

  /// Append live entries with `lo <= key <= hi` to `out`, sorted by key
  /// 将 `lo <= key <= hi` 的存活条目按键序追加到 `out`
  pub fn range(
    &mut self,
    lo: K,
    hi: K,
    expiry: T,
    out: &mut Vec<Entry<K, T>>,
  ) -> Option<Update<K, T>> {
    if self.is_expired(expiry) {
      return Some(Update::Delete { carry: None });
    }
    let start = out.len();
    let mut i = self.lower_bound(lo);
    while i < self.data.len() && self.data[i].key <= hi {
      if !self.reclaim(i, expiry) {
        out.push(self.data[i]);
      }
      i += 1;
    }
    let mid = out.len();
    let j = self.buf.partition_point(|e| e.key < lo);
    out.extend(
      self.buf[j..]
        .iter()
        .take_while(|e| e.key <= hi)
        .filter(|e| e.is_live(expiry)),
    );
    if mid > start && out.len() > mid {
      out[start..].sort_by_key(|e| e.key);
    }
    self.occupancy()
  }

  pub fn insert(&mut self, e: Entry<K, T>, expiry: T, conf: &Conf) -> Option<Update<K, T>> {
    if self.is_expired(expiry) {
      return Some(Update::Delete { carry: Some(e) });
    }
    let Some(last) = self.data.last() else {
      self.key_start = e.key;
      return self.append(e, conf);
    };
    if e.key >= last.key {
      return self.append(e, conf);
    }

    let u = self.upper_bound(e.key);
    let pos = match self.closest_free(u, conf.max_error, expiry) {
      Some(g) if g >= u => {
        if g > u {
          self.data.copy_within(u..g, u + 1);
          self.right_bound += 1;
        }
        self.data[u] = e;
        u
      }
      Some(g) => {
        if g + 1 < u {
          self.data.copy_within(g + 1..u, g);
          self.left_bound += 1;
        }
        self.data[u - 1] = e;
        u - 1
      }
      None if self.right_bound < conf.max_error => {
        self.data.insert(u, e);
        self.right_bound += 1;
        u
      }
      None => return self.buffer(e, conf),
    };
    self.max_ts = self.max_ts.max(e.ts);
    self.live += 1;
    self.widen(pos, e.key);
    None
  }

  /// Closest reclaimable slot to insertion point `u`; equal distance picks right
  /// 距插入点 `u` 最近的可回收槽位；距离相同取右侧
  fn closest_free(&mut self, u: usize, radius: usize, expiry: T) -> Option<usize> {
    let len = self.data.len();
    let right = (u..len.min(u + radius + 1)).find(|&j| self.reclaim(j, expiry));
    let left = if u == 0 {
      None
    } else {
      (u.saturating_sub(radius + 1)..u)
        .rev()
        .find(|&j| self.reclaim(j, expiry))
    };
    match (left, right) {
      (Some(l), Some(r)) if u - 1 - l < r - u => Some(l),
      (l, r) => r.or(l),
    }
  }

  fn append(&mut self, e: Entry<K, T>, conf: &Conf) -> Option<Update<K, T>> {
    let pos = self.data.len();
    let dx = e.key.as_f64() - self.key_start.as_f64();
    match self.cone.check(dx, pos) {
      Fit::Ok => {
        self.cone.push(dx, pos);
        self.data.push(e);
      }
      Fit::Pad(p) if p - pos <= conf.max_error => {
        // carry the previous key forward so data stays sorted
        let carry = self.data[pos - 1].key;
        self.data.resize(p, Entry::gap(carry));
        self.cone.push(dx, p);
        self.data.push(e);
      }
      // a new segment must start above every key held here, buffered included
      Fit::Pad(_) if e.key > self.max_key() => return Some(Update::Split(e)),
      Fit::Pad(_) => return self.buffer(e, conf),
      Fit::No => return self.buffer(e, conf),
    }
    self.slope = self.cone.slope();
    self.max_ts = self.max_ts.max(e.ts);
    self.live += 1;
    None
  }

  fn buffer(&mut self, e: Entry<K, T>, conf: &Conf) -> Option<Update<K, T>> {
    let i = self.buf.partition_point(|x| x.key <= e.key);
    self.buf.insert(i, e);
    self.max_ts = self.max_ts.max(e.ts);
    if self.buf.len() > conf.max_buffer {
      self.flagged = true;
      return Some(Update::Retrain);
    }
    None
  }

  /// Live entries of `data` and `buffer` in key order; detaches siblings
  /// `data` 与 `buffer` 中按键序排列的存活条目；断开兄弟链接
  pub fn merge_data(&mut self, expiry: T) -> Vec<Entry<K, T>> {
    self.left = None;
    self.right = None;
    let mut out = Vec::with_capacity(self.live + self.buf.len());
    let mut a = self.data.iter().filter(|e| e.is_live(expiry)).peekable();
    let mut b = self.buf.iter().filter(|e| e.is_live(expiry)).peekable();
    loop {
      let next = match (a.peek(), b.peek()) {
        (Some(x), Some(y)) => {
          if x.key <= y.key {
            a.next()
          } else {
            b.next()
          }
        }
        (Some(_), None) => a.next(),
        (None, Some(_)) => b.next(),
        (None, None) => break,
      };
      out.extend(next.copied());
    }
    out
  }

  /// Raw slots, gaps included
  /// 原始槽位（含空隙）
  pub fn slots(&self) -> &[Entry<K, T>] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::fit_runs;

  fn conf() -> Conf {
    Conf {
      window: 5,
      max_buffer: 4,
      error: 2,
      max_error: 4,
      ..Conf::default()
    }
  }

  fn seg(keys: &[u64], ts: u64) -> Segment<u64, u64> {
    let data: Vec<_> = keys.iter().map(|&k| Entry::new(k, ts)).collect();
    let runs = fit_runs(&data, 2, 1);
    assert_eq!(runs.len(), 1);
    Segment::new(&data, runs[0].cone, 2)
  }

  #[test]
  fn lookup_expires_lazily() {
    let mut s = seg(&[10, 20, 30, 40], 3);
    s.insert(Entry::new(50, 9), 0, &conf());
    assert_eq!(s.lookup(20, 1), (true, None));
    assert_eq!(s.live(), 5);
    // expiry 4: key 20 (ts 3) is gone and its slot becomes a gap
    assert!(!s.lookup(20, 4).0);
    assert_eq!(s.live(), 4);
    assert!(s.slots()[1].is_gap());
    assert!(s.lookup(50, 4).0);
  }

  #[test]
  fn whole_segment_expired() {
    let mut s = seg(&[1, 2, 3], 3);
    assert_eq!(s.lookup(1, 4), (false, Some(Update::Delete { carry: None })));
    let e = Entry::new(4, 10);
    assert_eq!(
      s.insert(e, 4, &conf()),
      Some(Update::Delete { carry: Some(e) })
    );
  }

  #[test]
  fn insert_reuses_gap() {
    let mut s = seg(&[10, 20, 30, 40, 50], 3);
    assert!(s.insert(Entry::new(60, 9), 0, &conf()).is_none());
    assert!(!s.lookup(30, 4).0);
    let len = s.len();
    assert!(s.insert(Entry::new(25, 9), 4, &conf()).is_none());
    assert_eq!(s.len(), len);
    assert!(s.lookup(25, 4).0);
    let keys: Vec<u64> = s.slots().iter().map(|e| e.key).collect();
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
  }

  #[test]
  fn overflow_reports_until_merged() {
    let c = conf();
    let mut s = seg(&[0, 1000], 9);
    let mut reported = Vec::new();
    for k in 1..40 {
      if s.insert(Entry::new(k, 9), 0, &c) == Some(Update::Retrain) {
        reported.push(k);
      }
    }
    // once over the cap every later insert reports again
    assert!(!reported.is_empty());
    assert!(reported.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(reported.last(), Some(&39));
    assert!(s.is_flagged());
    assert!(s.buffer_len() > c.max_buffer);
    for k in 1..40 {
      assert!(s.lookup(k, 0).0, "{k}");
    }
    let merged = s.merge_data(0);
    assert_eq!(merged.len(), 41);
    assert!(merged.windows(2).all(|w| w[0].key <= w[1].key));
  }

  #[test]
  fn append_pads_or_splits() {
    let c = conf();
    let mut s = seg(&[0, 10, 20, 30], 9);
    // on model, plain append
    assert!(s.insert(Entry::new(40, 9), 0, &c).is_none());
    // a little ahead of the model: padded with gaps
    assert!(s.insert(Entry::new(200, 9), 0, &c).is_none());
    assert!(s.len() > 6);
    assert!(s.slots().iter().any(|e| e.is_gap()));
    // far ahead: new segment
    let far = Entry::new(100_000, 9);
    assert_eq!(s.insert(far, 0, &c), Some(Update::Split(far)));
    assert!(s.lookup(200, 0).0 && s.lookup(40, 0).0);
  }

  #[test]
  fn range_merges_buffer() {
    let c = conf();
    let mut s = seg(&[0, 1000], 9);
    for k in (1..30).rev() {
      s.insert(Entry::new(k, 9), 0, &c);
    }
    let mut out = Vec::new();
    s.range(5, 25, 0, &mut out);
    let keys: Vec<u64> = out.iter().map(|e| e.key).collect();
    assert_eq!(keys, (5..=25).collect::<Vec<_>>());
  }
}
