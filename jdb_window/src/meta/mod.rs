//! Meta layer: one partition's slice of the gapped meta array
//! 元层：单个分区所持有的带空隙元数组切片
//!
//! Slot `i` of a slice holds the boundary key of the segment stored there.
//! Gap slots repeat the key of the closest segment on their left, leading
//! gaps repeat the first segment's key, so `keys` stays sorted and an upper
//! bound search lands on the owning segment.
//!
//! 切片第 `i` 个槽位保存其中段的边界键。空隙槽位重复其左侧最近段的键，
//! 前导空隙重复首段的键，因此 `keys` 保持有序，上界查找即落在所属段。

#![allow(
  clippy::cast_precision_loss,
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap,
  clippy::cast_sign_loss
)]

mod retrain;

use std::mem::size_of;

use log::debug;
pub(crate) use retrain::{Route, kept_keys, layout, rebuild};

use crate::{
  Bitmap, Conf, Entry, Key, SearchBound, Segment, Ts, Update,
  arena::{Arena, SegId},
  conf::{MAX_META_ERROR, MAX_OCCUPANCY, META_ERROR_FACTOR, MIN_META_RETRAIN_SLOTS, MIN_OCCUPANCY},
  error::fatal,
  model::{MetaModel, fit_runs},
  stats::{Stats, bump},
};

/// Occupancy must drift this far past its post-rebuild value to retrigger
/// 占用率须较重建后偏移超过此值才会再次触发
const OCCUPANCY_SLACK: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RetrainKind {
  /// Stretch the old model / 拉伸旧模型
  Extend,
  /// Least squares refit / 最小二乘重新拟合
  Full,
}

#[derive(Debug)]
pub(crate) struct Part<K, T> {
  pub id: usize,
  /// Global slot of local slot 0 / 本地槽位 0 对应的全局槽位
  pub base: usize,
  /// Owns keys in `[lo, hi)`, `None` is unbounded
  /// 拥有 `[lo, hi)` 内的键，`None` 表示无界
  pub lo: Option<K>,
  pub hi: Option<K>,
  keys: Vec<K>,
  slots: Vec<Option<SegId>>,
  occupied: Bitmap,
  retrain: Bitmap,
  arena: Arena<Segment<K, T>>,
  count: usize,
  model: MetaModel,
  left_bound: usize,
  right_bound: usize,
  rebuilt_err: usize,
  rebuilt_occ: f64,
  pub watermark: T,
  pub frozen: bool,
  /// Inserts that arrived while frozen / 冻结期间到达的插入
  pub queued: Vec<Entry<K, T>>,
}

impl<K: Key, T: Ts> Part<K, T> {
  /// Lay out `placed` (local slot, segment) pairs, slots ascending
  /// 布置 (本地槽位, 段) 对，槽位递增
  pub fn new(
    id: usize,
    base: usize,
    lo: Option<K>,
    hi: Option<K>,
    len: usize,
    model: MetaModel,
    placed: impl IntoIterator<Item = (usize, Segment<K, T>)>,
  ) -> Self {
    let mut part = Self {
      id,
      base,
      lo,
      hi,
      keys: vec![K::default(); len],
      slots: vec![None; len],
      occupied: Bitmap::new(len),
      retrain: Bitmap::new(len),
      arena: Arena::default(),
      count: 0,
      model,
      left_bound: 0,
      right_bound: 0,
      rebuilt_err: 0,
      rebuilt_occ: 0.0,
      watermark: T::ZERO,
      frozen: false,
      queued: Vec::new(),
    };

    let mut prev = None;
    for (slot, mut seg) in placed {
      let key = seg.key_start();
      seg.parent = slot;
      seg.left = prev;
      seg.right = None;
      let id = part.arena.alloc(seg);
      if let Some(p) = prev {
        part.arena.get_mut(p).right = Some(id);
      }
      part.slots[slot] = Some(id);
      part.occupied.set(slot);
      part.keys[slot] = key;
      part.count += 1;
      part.widen(slot, key);
      prev = Some(id);
    }

    if let Some(first) = part.occupied.next_set(0, len) {
      let mut carry = part.keys[first];
      for j in 0..len {
        if part.occupied.get(j) {
          carry = part.keys[j];
        } else {
          part.keys[j] = carry;
        }
      }
    }
    part.rebuilt_err = part.left_bound.max(part.right_bound);
    part.rebuilt_occ = part.count as f64 / len.max(1) as f64;
    part
  }

  #[inline]
  pub fn owns(&self, key: K) -> bool {
    self.lo.is_none_or(|lo| key >= lo) && self.hi.is_none_or(|hi| key < hi)
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.keys.len()
  }

  #[inline]
  pub fn seg_count(&self) -> usize {
    self.count
  }

  #[inline]
  pub fn bounds(&self) -> (usize, usize) {
    (self.left_bound, self.right_bound)
  }

  #[inline]
  fn bound(&self, key: K) -> SearchBound {
    SearchBound::new(
      self.model.predict(key.as_f64()) - self.base as isize,
      self.left_bound,
      self.right_bound,
      self.keys.len(),
      !self.model.degenerate(),
    )
  }

  #[inline]
  fn seg_id(&self, slot: usize) -> SegId {
    match self.slots[slot] {
      Some(id) => id,
      None => fatal!("partition {}: slot {slot} is a gap", self.id),
    }
  }

  /// Slot of the segment responsible for `key`
  /// 负责 `key` 的段所在槽位
  fn find_slot(&self, key: K, hint: Option<SearchBound>) -> usize {
    let len = self.keys.len();
    let sb = match hint {
      Some(b) => b.fit(len),
      None => self.bound(key),
    };
    let keys = &self.keys;
    let i = sb.partition_point(len, |i| keys[i] <= key).saturating_sub(1);
    if self.occupied.get(i) {
      return i;
    }
    match self
      .occupied
      .prev_set(i, 0)
      .or_else(|| self.occupied.next_set(i, len))
    {
      Some(s) => s,
      None => fatal!("partition {}: no segment left", self.id),
    }
  }

  /// Segments in key order
  /// 按键序排列的段
  pub fn chain(&self) -> impl Iterator<Item = &Segment<K, T>> + '_ {
    let mut cur = self
      .occupied
      .next_set(0, self.keys.len())
      .map(|s| self.seg_id(s));
    std::iter::from_fn(move || {
      let seg = self.arena.get(cur?);
      cur = seg.right;
      Some(seg)
    })
    .take(self.count)
  }

  pub fn lookup(
    &mut self,
    key: K,
    expiry: T,
    hint: Option<SearchBound>,
    conf: &Conf,
    stats: &Stats,
  ) -> bool {
    let slot = self.find_slot(key, hint);
    let id = self.seg_id(slot);
    let (found, up) = self.arena.get_mut(id).lookup(key, expiry);
    if let Some(up) = up {
      self.apply(&[(slot, up)], expiry, conf, stats);
    }
    found
  }

  /// Append live entries in `[lo, hi]` held by this partition
  /// 追加本分区内 `[lo, hi]` 的存活条目
  pub fn range(
    &mut self,
    lo: K,
    hi: K,
    expiry: T,
    out: &mut Vec<Entry<K, T>>,
    conf: &Conf,
    stats: &Stats,
  ) {
    let slot = if self.owns(lo) {
      self.find_slot(lo, None)
    } else {
      match self.occupied.next_set(0, self.keys.len()) {
        Some(s) => s,
        None => return,
      }
    };
    let mut pending = Vec::new();
    let mut id = self.seg_id(slot);
    loop {
      let seg = self.arena.get_mut(id);
      if let Some(up) = seg.range(lo, hi, expiry, out) {
        pending.push((seg.parent, up));
      }
      let next = seg.right;
      match next {
        Some(r) if self.arena.get(r).key_start() <= hi => id = r,
        _ => break,
      }
    }
    self.apply(&pending, expiry, conf, stats);
  }

  /// Insert `e` stamped at its own timestamp
  /// 插入 `e`，以其自身时间戳为当前时间
  pub fn insert(&mut self, e: Entry<K, T>, conf: &Conf, stats: &Stats) {
    self.watermark = self.watermark.max(e.ts);
    let expiry = e.ts.expiry(conf.window);
    let slot = self.find_slot(e.key, None);
    self.insert_at(slot, e, expiry, conf, stats);
  }

  fn insert_at(&mut self, slot: usize, e: Entry<K, T>, expiry: T, conf: &Conf, stats: &Stats) {
    let id = self.seg_id(slot);
    if let Some(up) = self.arena.get_mut(id).insert(e, expiry, conf) {
      self.apply(&[(slot, up)], expiry, conf, stats);
    }
  }

  /// Act on segment signals. Deletes never move slots, so every slot in
  /// `pending` stays valid until the retrain pass at the end.
  ///
  /// The first report of a segment only sets its retrain bit. A report that
  /// finds the bit already set, or lands next to a flagged slot, merges the
  /// flagged run around it.
  ///
  /// 处理段信号。删除不移动槽位，故 `pending` 中的槽位在末尾重训前一直有效。
  /// 段的首次上报只置重训位；发现该位已置或紧邻已标记槽位的上报，合并其所在的标记连续段。
  fn apply(&mut self, pending: &[(usize, Update<K, T>)], expiry: T, conf: &Conf, stats: &Stats) {
    let mut ready = Vec::new();
    for &(slot, up) in pending {
      match up {
        Update::Retrain => {
          if !self.occupied.get(slot) {
            continue;
          }
          if self.retrain.get(slot) {
            bump(&stats.absorbed);
            ready.push(self.seg_id(slot));
          } else {
            bump(&stats.retrain_signals);
            self.retrain.set(slot);
            if self.flagged_beside(slot) {
              ready.push(self.seg_id(slot));
            }
          }
        }
        Update::Delete { carry: None } => {
          self.delete(slot, expiry, stats);
        }
        Update::Delete { carry: Some(e) } => self.expire_insert(slot, e, expiry, conf, stats),
        Update::Split(e) => {
          bump(&stats.splits);
          self.insert_seg(Segment::single(e, conf.error), conf);
        }
      }
    }
    for id in ready {
      self.retrain_around(id, expiry, conf, stats);
    }
  }

  #[inline]
  fn flagged_beside(&self, slot: usize) -> bool {
    (slot > 0 && self.retrain.get(slot - 1))
      || (slot + 1 < self.keys.len() && self.retrain.get(slot + 1))
  }

  /// Drop an expired segment. The last one of a partition always stays.
  /// 删除过期段。分区的最后一个段始终保留。
  fn delete(&mut self, slot: usize, expiry: T, stats: &Stats) -> bool {
    if self.count <= 1
      || !self.occupied.get(slot)
      || !self.arena.get(self.seg_id(slot)).is_expired(expiry)
    {
      return false;
    }
    let seg = self.take(slot);
    bump(&stats.deletes);
    debug!(
      "partition {}: drop expired segment {:?} at slot {slot}",
      self.id,
      seg.key_start()
    );
    true
  }

  /// The segment at `slot` expired while `e` was being inserted. Hand `e` to
  /// the sibling that takes over its key range, else reuse the segment.
  /// 插入 `e` 时 `slot` 处的段已过期。将 `e` 交给接管其键范围的兄弟段，否则复用该段。
  fn expire_insert(&mut self, slot: usize, e: Entry<K, T>, expiry: T, conf: &Conf, stats: &Stats) {
    let seg = self.arena.get(self.seg_id(slot));
    let live = |n: SegId| !self.arena.get(n).is_expired(expiry);
    // after the delete the left sibling inherits the range; the right one
    // only when this was the first segment
    let heir = match (seg.left, seg.right) {
      (Some(l), _) if live(l) => Some(l),
      (None, Some(r)) if live(r) => Some(r),
      _ => None,
    };
    match heir {
      Some(n) => {
        let to = self.arena.get(n).parent;
        self.delete(slot, expiry, stats);
        self.insert_at(to, e, expiry, conf, stats);
      }
      None => {
        let mut seg = self.take(slot);
        seg.reset(e, conf.error);
        self.insert_seg(seg, conf);
        bump(&stats.replaces);
      }
    }
  }

  /// Remove the segment at `slot`, unlinking it from its siblings
  /// 移除 `slot` 处的段并从兄弟链中解除
  fn take(&mut self, slot: usize) -> Segment<K, T> {
    let Some(id) = self.slots[slot].take() else {
      fatal!("partition {}: take of gap slot {slot}", self.id)
    };
    self.occupied.clear(slot);
    self.retrain.clear(slot);
    self.count -= 1;
    let mut seg = self.arena.remove(id);
    if let Some(l) = seg.left {
      self.arena.get_mut(l).right = seg.right;
    }
    if let Some(r) = seg.right {
      self.arena.get_mut(r).left = seg.left;
    }
    seg.left = None;
    seg.right = None;
    self.fix_keys(slot);
    seg
  }

  /// Restore the gap key rule around a slot that just changed
  /// 在刚变化的槽位附近恢复空隙键规则
  fn fix_keys(&mut self, slot: usize) {
    let len = self.keys.len();
    let Some(first) = self.occupied.next_set(0, len) else {
      return;
    };
    if slot <= first {
      let k = self.keys[first];
      self.keys[..first].fill(k);
    }
    let start = self.occupied.prev_set(slot, 0).unwrap_or(first);
    let carry = self.keys[start];
    let mut j = start + 1;
    while j < len && !self.occupied.get(j) {
      self.keys[j] = carry;
      j += 1;
    }
  }

  /// Place a new segment at its predicted position, shifting toward the
  /// nearest gap (right on a tie) or growing the slice when none is in reach
  /// 将新段放到预测位置，向最近空隙移位（等距取右），无可达空隙时扩展切片
  fn insert_seg(&mut self, seg: Segment<K, T>, conf: &Conf) -> usize {
    let key = seg.key_start();
    let len = self.keys.len();
    let keys = &self.keys;
    let u = self.bound(key).partition_point(len, |i| keys[i] <= key);
    let radius = self.left_bound.max(self.right_bound).max(conf.error);
    let slot = match self.occupied.closest_clear(u, radius) {
      Some(g) if g >= u => {
        if g > u {
          self.shift_up(u, g);
        }
        u
      }
      Some(g) => {
        if g + 1 < u {
          self.shift_down(g, u - 1);
        }
        u - 1
      }
      None => {
        self.grow(u);
        u
      }
    };
    self.place(slot, seg);
    slot
  }

  /// `[from, to)` moves to `[from + 1, to]`, `to` must be a gap
  fn shift_up(&mut self, from: usize, to: usize) {
    self.keys.copy_within(from..to, from + 1);
    self.slots[from..=to].rotate_right(1);
    self.occupied.shift_up(from, to);
    self.retrain.shift_up(from, to);
    self.reparent(from + 1, to + 1);
    self.right_bound += 1;
  }

  /// `(from, to]` moves to `[from, to)`, `from` must be a gap
  fn shift_down(&mut self, from: usize, to: usize) {
    self.keys.copy_within(from + 1..=to, from);
    self.slots[from..=to].rotate_left(1);
    self.occupied.shift_down(from, to);
    self.retrain.shift_down(from, to);
    self.reparent(from, to);
    self.left_bound += 1;
  }

  fn grow(&mut self, at: usize) {
    let carry = self.keys.get(at).or(self.keys.last()).copied().unwrap_or_default();
    self.keys.insert(at, carry);
    self.slots.insert(at, None);
    self.occupied.insert(at, false);
    self.retrain.insert(at, false);
    self.reparent(at + 1, self.slots.len());
    self.right_bound += 1;
  }

  fn reparent(&mut self, from: usize, to: usize) {
    for j in from..to {
      if let Some(id) = self.slots[j] {
        self.arena.get_mut(id).parent = j;
      }
    }
  }

  fn place(&mut self, slot: usize, mut seg: Segment<K, T>) {
    let len = self.keys.len();
    let key = seg.key_start();
    let left = slot
      .checked_sub(1)
      .and_then(|s| self.occupied.prev_set(s, 0))
      .map(|s| self.seg_id(s));
    let right = self
      .occupied
      .next_set(slot + 1, len)
      .map(|s| self.seg_id(s));
    seg.left = left;
    seg.right = right;
    seg.parent = slot;
    let id = self.arena.alloc(seg);
    if let Some(l) = left {
      self.arena.get_mut(l).right = Some(id);
    }
    if let Some(r) = right {
      self.arena.get_mut(r).left = Some(id);
    }
    self.slots[slot] = Some(id);
    self.occupied.set(slot);
    self.keys[slot] = key;
    self.count += 1;
    self.fix_keys(slot);
    self.widen(slot, key);
  }

  #[inline]
  fn widen(&mut self, slot: usize, key: K) {
    let err = (self.base + slot) as isize - self.model.predict(key.as_f64());
    if err > 0 {
      self.right_bound = self.right_bound.max(err as usize);
    } else {
      self.left_bound = self.left_bound.max(err.unsigned_abs());
    }
  }

  /// Merge the flagged run holding segment `id`. Skipped when an earlier
  /// run of the same pass already took it.
  /// 合并包含段 `id` 的标记连续段。若本轮先前的合并已处理则跳过。
  fn retrain_around(&mut self, id: SegId, expiry: T, conf: &Conf, stats: &Stats) {
    let Some(slot) = self.arena.try_get(id).map(|seg| seg.parent) else {
      return;
    };
    if self.slots.get(slot) != Some(&Some(id)) || !self.retrain.get(slot) {
      return;
    }
    let len = self.keys.len();
    let a = self.retrain.prev_clear(slot, 0).map_or(0, |j| j + 1);
    let b = self.retrain.next_clear(slot, len).unwrap_or(len);
    self.retrain_run(a, b, expiry, conf, stats);
  }

  /// Merge the flagged neighbours in `[a, b)` into one entry list and refit
  /// 将 `[a, b)` 中被标记的相邻段合并为一个条目列表并重新拟合
  fn retrain_run(&mut self, a: usize, b: usize, expiry: T, conf: &Conf, stats: &Stats) {
    for s in a..b {
      self.retrain.clear(s);
    }
    // a partition whose every segment expired keeps its last one as is
    if b - a == self.count
      && (a..b).all(|s| self.arena.get(self.seg_id(s)).is_expired(expiry))
    {
      return;
    }

    let mut entries = Vec::new();
    for s in a..b {
      let mut seg = self.take(s);
      entries.extend(seg.merge_data(expiry));
    }
    let runs = fit_runs(&entries, conf.error, 1);
    debug!(
      "partition {}: retrain {} segments into {}",
      self.id,
      b - a,
      runs.len()
    );
    for run in runs {
      self.insert_seg(Segment::new(&entries[run.range], run.cone, conf.error), conf);
    }
    bump(&stats.seg_retrains);
  }

  /// Whether the meta array needs a global rebuild
  /// 元数组是否需要全局重建
  pub fn retrain_kind(&self, conf: &Conf) -> Option<RetrainKind> {
    let err = self.left_bound.max(self.right_bound);
    let cap = ((META_ERROR_FACTOR * self.count as f64).ceil() as usize)
      .min(MAX_META_ERROR)
      .max(conf.error)
      .max(2 * self.rebuilt_err);
    if err > cap {
      return Some(RetrainKind::Full);
    }
    let len = self.keys.len();
    if len < MIN_META_RETRAIN_SLOTS {
      return None;
    }
    let occ = self.count as f64 / len as f64;
    if occ < MIN_OCCUPANCY && occ < self.rebuilt_occ - OCCUPANCY_SLACK {
      return Some(RetrainKind::Full);
    }
    if occ > MAX_OCCUPANCY && occ > self.rebuilt_occ + OCCUPANCY_SLACK {
      return Some(RetrainKind::Extend);
    }
    None
  }

  /// Move every segment out in key order
  /// 按键序移出所有段
  pub fn drain_segments(&mut self) -> Vec<Segment<K, T>> {
    let ids: Vec<SegId> = self.occupied.iter_ones().map(|s| self.seg_id(s)).collect();
    self.count = 0;
    ids
      .into_iter()
      .map(|id| {
        let mut seg = self.arena.remove(id);
        seg.left = None;
        seg.right = None;
        seg
      })
      .collect()
  }

  pub fn mem_usage(&self) -> usize {
    size_of::<Self>()
      + self.keys.capacity() * size_of::<K>()
      + self.slots.capacity() * size_of::<Option<SegId>>()
      + self.occupied.mem_usage()
      + self.retrain.mem_usage()
      + self.queued.capacity() * size_of::<Entry<K, T>>()
      + self.arena.values().map(Segment::mem_usage).sum::<usize>()
  }

  /// Check the slice invariants, describing the first violation found
  /// 检查切片不变量，返回发现的第一个违例
  pub fn verify(&self) -> Result<(), String> {
    let id = self.id;
    let len = self.keys.len();
    if self.slots.len() != len || self.occupied.len() != len || self.retrain.len() != len {
      return Err(format!("partition {id}: array lengths differ"));
    }
    if self.count == 0 {
      return Err(format!("partition {id}: no segment"));
    }
    if self.occupied.count_ones() != self.count || self.arena.len() != self.count {
      return Err(format!("partition {id}: segment count mismatch"));
    }
    if let Some(j) = self.keys.windows(2).position(|w| w[0] > w[1]) {
      return Err(format!("partition {id}: keys unsorted at slot {j}"));
    }

    let mut order = Vec::with_capacity(self.count);
    for s in 0..len {
      match (self.slots[s], self.occupied.get(s)) {
        (Some(sid), true) => {
          let seg = self.arena.get(sid);
          if seg.parent != s {
            return Err(format!("partition {id}: slot {s} parent is {}", seg.parent));
          }
          if seg.key_start() != self.keys[s] {
            return Err(format!("partition {id}: slot {s} key differs from its segment"));
          }
          if !self.owns(seg.key_start()) {
            return Err(format!("partition {id}: slot {s} key out of range"));
          }
          let pred = self.model.predict(seg.key_start().as_f64());
          let at = (self.base + s) as isize;
          if at < pred - self.left_bound as isize || at > pred + self.right_bound as isize {
            return Err(format!("partition {id}: slot {s} outside error bounds"));
          }
          order.push(sid);
        }
        (None, false) => {
          if self.retrain.get(s) {
            return Err(format!("partition {id}: retrain bit on gap {s}"));
          }
        }
        _ => return Err(format!("partition {id}: bitmap disagrees at slot {s}")),
      }
    }

    for (i, &sid) in order.iter().enumerate() {
      let seg = self.arena.get(sid);
      let left = i.checked_sub(1).map(|j| order[j]);
      if seg.left != left || seg.right != order.get(i + 1).copied() {
        return Err(format!("partition {id}: sibling links broken at slot {}", seg.parent));
      }
    }
    Ok(())
  }
}
