//! Word-packed bitmap with directional nearest-bit search
//! 按字打包的位图，支持定向最近位查找
//!
//! Tracks occupied and retrain-flagged slots of the meta array.
//! 用于记录元数组中已占用和待重训的槽位。

const W: usize = 64;

/// Bits `lo..=hi` of a word
#[inline(always)]
fn mask(lo: usize, hi: usize) -> u64 {
  let upper = if hi == W - 1 {
    u64::MAX
  } else {
    (1u64 << (hi + 1)) - 1
  };
  upper & (u64::MAX << lo)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
  words: Vec<u64>,
  len: usize,
}

impl Bitmap {
  pub fn new(len: usize) -> Self {
    Self {
      words: vec![0; len.div_ceil(W)],
      len,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn get(&self, i: usize) -> bool {
    debug_assert!(i < self.len);
    self.words[i / W] >> (i % W) & 1 == 1
  }

  #[inline]
  pub fn set(&mut self, i: usize) {
    debug_assert!(i < self.len);
    self.words[i / W] |= 1 << (i % W);
  }

  #[inline]
  pub fn clear(&mut self, i: usize) {
    debug_assert!(i < self.len);
    self.words[i / W] &= !(1 << (i % W));
  }

  #[inline]
  pub fn assign(&mut self, i: usize, bit: bool) {
    if bit { self.set(i) } else { self.clear(i) }
  }

  pub fn count_ones(&self) -> usize {
    self.words.iter().map(|w| w.count_ones() as usize).sum()
  }

  pub fn mem_usage(&self) -> usize {
    self.words.capacity() * size_of::<u64>()
  }

  /// First bit in `[from, end)` equal to `bit`
  /// `[from, end)` 中第一个等于 `bit` 的位
  fn next(&self, from: usize, end: usize, bit: bool) -> Option<usize> {
    let end = end.min(self.len);
    if from >= end {
      return None;
    }
    let flip = if bit { 0 } else { u64::MAX };
    let mut w = from / W;
    let mut word = (self.words[w] ^ flip) & (u64::MAX << (from % W));
    loop {
      if word != 0 {
        let i = w * W + word.trailing_zeros() as usize;
        return (i < end).then_some(i);
      }
      w += 1;
      if w * W >= end {
        return None;
      }
      word = self.words[w] ^ flip;
    }
  }

  /// Last bit in `[start, from]` equal to `bit`
  /// `[start, from]` 中最后一个等于 `bit` 的位
  fn prev(&self, from: usize, start: usize, bit: bool) -> Option<usize> {
    if from >= self.len || start > from {
      return None;
    }
    let flip = if bit { 0 } else { u64::MAX };
    let mut w = from / W;
    let mut word = (self.words[w] ^ flip) & mask(0, from % W);
    loop {
      if word != 0 {
        let i = w * W + (W - 1) - word.leading_zeros() as usize;
        return (i >= start).then_some(i);
      }
      if w * W <= start {
        return None;
      }
      w -= 1;
      word = self.words[w] ^ flip;
    }
  }

  #[inline]
  pub fn next_set(&self, from: usize, end: usize) -> Option<usize> {
    self.next(from, end, true)
  }

  #[inline]
  pub fn prev_set(&self, from: usize, start: usize) -> Option<usize> {
    self.prev(from, start, true)
  }

  #[inline]
  pub fn next_clear(&self, from: usize, end: usize) -> Option<usize> {
    self.next(from, end, false)
  }

  #[inline]
  pub fn prev_clear(&self, from: usize, start: usize) -> Option<usize> {
    self.prev(from, start, false)
  }

  /// Closest clear bit to an insertion point `pos` (between `pos - 1` and `pos`)
  /// within `radius` on either side. Equal distance picks the right side.
  ///
  /// 距插入点 `pos`（位于 `pos - 1` 与 `pos` 之间）最近的清零位，两侧半径为
  /// `radius`。距离相同时取右侧。
  pub fn closest_clear(&self, pos: usize, radius: usize) -> Option<usize> {
    let right = self.next_clear(pos, pos.saturating_add(radius).saturating_add(1));
    let left = if pos == 0 {
      None
    } else {
      self.prev_clear(pos - 1, (pos - 1).saturating_sub(radius))
    };
    match (left, right) {
      (Some(l), Some(r)) => {
        if pos - 1 - l < r - pos {
          Some(l)
        } else {
          Some(r)
        }
      }
      (l, r) => r.or(l),
    }
  }

  /// Move bits `[from, to)` up by one into `[from + 1, to]`; bit `from` is cleared
  /// 将 `[from, to)` 的位上移一位到 `[from + 1, to]`；`from` 位清零
  pub fn shift_up(&mut self, from: usize, to: usize) {
    if from >= to {
      return;
    }
    debug_assert!(to < self.len);
    let (fw, tw) = (from / W, to / W);
    for w in (fw..=tw).rev() {
      let lo = if w == fw { from % W } else { 0 };
      let hi = if w == tw { to % W } else { W - 1 };
      let m = mask(lo, hi);
      let carry = if w > fw { self.words[w - 1] >> (W - 1) } else { 0 };
      let shifted = (self.words[w] << 1) | carry;
      self.words[w] = (self.words[w] & !m) | (shifted & m);
    }
    self.clear(from);
  }

  /// Move bits `(from, to]` down by one into `[from, to)`; bit `to` is cleared
  /// 将 `(from, to]` 的位下移一位到 `[from, to)`；`to` 位清零
  pub fn shift_down(&mut self, from: usize, to: usize) {
    if from >= to {
      return;
    }
    debug_assert!(to < self.len);
    let (fw, tw) = (from / W, to / W);
    for w in fw..=tw {
      let lo = if w == fw { from % W } else { 0 };
      let hi = if w == tw { to % W } else { W - 1 };
      let m = mask(lo, hi);
      let carry = if w < tw { (self.words[w + 1] & 1) << (W - 1) } else { 0 };
      let shifted = (self.words[w] >> 1) | carry;
      self.words[w] = (self.words[w] & !m) | (shifted & m);
    }
    self.clear(to);
  }

  /// Grow by one, inserting `bit` at `pos`
  /// 长度加一，在 `pos` 处插入 `bit`
  pub fn insert(&mut self, pos: usize, bit: bool) {
    debug_assert!(pos <= self.len);
    self.len += 1;
    if self.words.len() * W < self.len {
      self.words.push(0);
    }
    let last = self.len - 1;
    self.clear(last);
    self.shift_up(pos, last);
    self.assign(pos, bit);
  }

  pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
    let mut cur = 0;
    std::iter::from_fn(move || {
      let i = self.next_set(cur, self.len)?;
      cur = i + 1;
      Some(i)
    })
  }
}
