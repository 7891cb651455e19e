//! Model-guided search
//! 模型引导的查找

#![allow(
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap,
  clippy::cast_sign_loss
)]

/// Precomputed search window for one key
/// 单个键的预计算查找窗口
///
/// `exp` false means the model is degenerate (single point) and a plain
/// binary search over `[lo, hi)` is used instead of galloping from `pos`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchBound {
  pub exp: bool,
  pub pos: usize,
  pub lo: usize,
  pub hi: usize,
}

impl SearchBound {
  /// Clamp a raw prediction and its error bounds to `[0, len)`
  /// 将原始预测及误差界限制在 `[0, len)` 内
  #[inline]
  pub fn new(pred: isize, left: usize, right: usize, len: usize, exp: bool) -> Self {
    let max = len.saturating_sub(1) as isize;
    let pos = pred.clamp(0, max) as usize;
    let lo = pred.saturating_sub(left as isize).clamp(0, max) as usize;
    let hi = (pred.saturating_add(right as isize).clamp(0, max) as usize + 1).min(len);
    Self { exp, pos, lo, hi }
  }

  /// Re-clamp after the slice length changed
  /// 切片长度变化后重新限制
  #[inline]
  pub fn fit(self, len: usize) -> Self {
    let max = len.saturating_sub(1);
    let lo = self.lo.min(max);
    Self {
      exp: self.exp,
      pos: self.pos.min(max),
      lo,
      hi: self.hi.min(len).max(lo),
    }
  }

  /// First index in `[0, len)` where `pred` is false (`pred` must be
  /// monotone: true then false)
  /// `[0, len)` 中第一个使 `pred` 为假的下标（`pred` 须单调）
  ///
  /// Tries the error window `[lo, hi]` first, gallops from `pos` when the
  /// model was off by more than its bounds.
  /// 先尝试误差窗口 `[lo, hi]`，模型误差超界时从 `pos` 指数查找。
  #[inline]
  pub fn partition_point(&self, len: usize, pred: impl Fn(usize) -> bool) -> usize {
    if !self.exp {
      return partition_point_in(0, len, pred);
    }
    let hi = self.hi.min(len);
    let lo = self.lo.min(hi);
    if (lo == 0 || pred(lo - 1)) && (hi == len || !pred(hi)) {
      partition_point_in(lo, hi, pred)
    } else {
      partition_point_from(len, self.pos, pred)
    }
  }
}

/// Binary search in `[lo, hi)`, answer known to be in `[lo, hi]`
/// 在 `[lo, hi)` 中二分，答案已知位于 `[lo, hi]`
#[inline]
pub fn partition_point_in(mut lo: usize, mut hi: usize, pred: impl Fn(usize) -> bool) -> usize {
  while lo < hi {
    let mid = lo + (hi - lo) / 2;
    if pred(mid) {
      lo = mid + 1;
    } else {
      hi = mid;
    }
  }
  lo
}

/// Exponential search outward from `hint`, then bounded binary search.
/// Correct for any hint; cost grows with log of the misprediction.
///
/// 从 `hint` 向外指数查找，再做有界二分。任意提示均正确，代价随预测误差对数增长。
pub fn partition_point_from(len: usize, hint: usize, pred: impl Fn(usize) -> bool) -> usize {
  if len == 0 {
    return 0;
  }
  let hint = hint.min(len - 1);
  if pred(hint) {
    // answer in (hint, len]
    let mut lo = hint + 1;
    let mut step = 1;
    loop {
      let probe = hint.saturating_add(step);
      if probe >= len {
        return partition_point_in(lo, len, pred);
      }
      if !pred(probe) {
        return partition_point_in(lo, probe, pred);
      }
      lo = probe + 1;
      step <<= 1;
    }
  } else {
    // answer in [0, hint]
    let mut hi = hint;
    let mut step = 1;
    loop {
      if step > hint {
        return partition_point_in(0, hi, pred);
      }
      let probe = hint - step;
      if pred(probe) {
        return partition_point_in(probe + 1, hi, pred);
      }
      hi = probe;
      step <<= 1;
    }
  }
}
