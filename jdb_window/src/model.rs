//! Piecewise linear models: shrinking cone and least squares
//! 分段线性模型：收缩锥与最小二乘
//!
//! Time Complexity: O(N) for fitting
//! 拟合时间复杂度 O(N)

#![allow(
  clippy::cast_precision_loss,
  clippy::cast_possible_truncation,
  clippy::cast_possible_wrap
)]

use std::ops::Range;

use crate::{Entry, Key};

/// Result of testing a point against a cone
/// 点相对于锥的检测结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fit {
  Ok,
  /// Feasible only at this larger position (pad gaps up to it)
  /// 仅在更大的位置可行（以空隙填充至该位置）
  Pad(usize),
  No,
}

/// Shrinking cone through the origin `(key_start, 0)`
/// 过原点 `(key_start, 0)` 的收缩锥
///
/// Keeps the band `[slope_lo, slope_hi]` of slopes that predict every pushed
/// point within `eps`. Its midpoint is the model slope.
#[derive(Clone, Copy, Debug)]
pub struct Cone {
  eps: f64,
  slope_lo: f64,
  slope_hi: f64,
}

impl Cone {
  pub fn new(eps: usize) -> Self {
    Self {
      eps: eps as f64,
      slope_lo: 0.0,
      slope_hi: f64::INFINITY,
    }
  }

  #[inline]
  pub fn slope(&self) -> f64 {
    if self.slope_hi.is_finite() {
      (self.slope_lo + self.slope_hi) * 0.5
    } else {
      self.slope_lo
    }
  }

  /// Test point `(dx, pos)`, `dx = key - key_start`
  /// 检测点 `(dx, pos)`，`dx = key - key_start`
  pub fn check(&self, dx: f64, pos: usize) -> Fit {
    let p = pos as f64;
    if dx <= 0.0 {
      return if p <= self.eps { Fit::Ok } else { Fit::No };
    }
    let lo = (p - self.eps) / dx;
    let hi = (p + self.eps) / dx;
    if lo.max(self.slope_lo) <= hi.min(self.slope_hi) {
      return Fit::Ok;
    }
    if hi < self.slope_lo {
      let need = ((self.slope_lo * dx - self.eps).ceil() as usize).max(pos + 1);
      if (need as f64 - self.eps) / dx <= self.slope_hi {
        return Fit::Pad(need);
      }
    }
    Fit::No
  }

  /// Tighten with a point already known to fit
  /// 用已确认可行的点收紧
  pub fn push(&mut self, dx: f64, pos: usize) {
    if dx <= 0.0 {
      return;
    }
    let p = pos as f64;
    self.slope_lo = self.slope_lo.max((p - self.eps) / dx);
    self.slope_hi = self.slope_hi.min((p + self.eps) / dx);
  }
}

/// A maximal error-bounded run of entries
/// 一段满足误差界的最长条目序列
#[derive(Clone, Debug)]
pub struct Run {
  pub range: Range<usize>,
  pub cone: Cone,
}

/// Split sorted entries into runs using the streaming shrinking cone.
/// Runs are capped at `len / min_runs`. When equal-key blocks defeat the cap,
/// the longest runs are cut at key changes, so at least `min_runs` exist
/// whenever there are that many distinct keys.
///
/// 使用流式收缩锥将已排序条目切分为若干段。段长上限为 `len / min_runs`。
/// 等键块突破上限时在键变化处切分最长的段，故不同键足够时至少有 `min_runs` 段。
pub fn fit_runs<K: Key, T>(data: &[Entry<K, T>], eps: usize, min_runs: usize) -> Vec<Run> {
  let n = data.len();
  if n == 0 {
    return vec![];
  }
  let max_len = (n / min_runs.max(1)).max(1);
  let mut runs = Vec::with_capacity((n / (eps * 2).max(1)).clamp(1, 1 << 20));

  let mut start = 0;
  while start < n {
    let first_key = data[start].key.as_f64();
    let mut cone = Cone::new(eps);
    let mut end = start + 1;

    while end < n && end - start < max_len {
      let dx = data[end].key.as_f64() - first_key;
      let pos = end - start;
      if cone.check(dx, pos) != Fit::Ok {
        break;
      }
      cone.push(dx, pos);
      end += 1;
    }

    // a block of equal keys never straddles two runs, routing relies on it
    if end < n && data[end].key == data[end - 1].key {
      let key = data[end].key;
      let mut b = end - 1;
      while b > start && data[b - 1].key == key {
        b -= 1;
      }
      if b > start {
        end = b;
      } else {
        while end < n && data[end].key == key {
          end += 1;
        }
      }
    }

    runs.push(Run {
      range: start..end,
      cone,
    });
    start = end;
  }

  while runs.len() < min_runs {
    let Some((i, cut)) = runs
      .iter()
      .enumerate()
      .filter_map(|(i, r)| key_change(data, &r.range).map(|cut| (i, cut)))
      .max_by_key(|&(i, _)| runs[i].range.len())
    else {
      break;
    };
    let Range { start, end } = runs[i].range.clone();
    runs[i] = refit(data, start..cut, eps);
    runs.insert(i + 1, refit(data, cut..end, eps));
  }

  runs
}

/// Index in `range` where the key changes, closest to its middle
/// `range` 中最靠近中点的键变化位置
fn key_change<K: Key, T>(data: &[Entry<K, T>], range: &Range<usize>) -> Option<usize> {
  let changes = |j: &usize| data[*j].key != data[*j - 1].key;
  let mid = range.start + range.len() / 2;
  let right = (mid.max(range.start + 1)..range.end).find(changes);
  let left = (range.start + 1..mid).rev().find(changes);
  match (left, right) {
    (Some(l), Some(r)) if mid - l < r - mid => Some(l),
    (l, r) => r.or(l),
  }
}

/// Cone over `range`, skipping points it cannot hold
/// `range` 上的锥，跳过无法容纳的点
fn refit<K: Key, T>(data: &[Entry<K, T>], range: Range<usize>, eps: usize) -> Run {
  let first_key = data[range.start].key.as_f64();
  let mut cone = Cone::new(eps);
  for (pos, e) in data[range.clone()].iter().enumerate().skip(1) {
    let dx = e.key.as_f64() - first_key;
    if cone.check(dx, pos) == Fit::Ok {
      cone.push(dx, pos);
    }
  }
  Run { range, cone }
}

/// Ordinary least squares `y = slope * x + intercept`
/// 普通最小二乘 `y = slope * x + intercept`
pub fn least_squares(points: impl Iterator<Item = (f64, f64)> + Clone) -> (f64, f64) {
  let (mut n, mut sx, mut sy) = (0.0, 0.0, 0.0);
  for (x, y) in points.clone() {
    n += 1.0;
    sx += x;
    sy += y;
  }
  if n == 0.0 {
    return (0.0, 0.0);
  }
  let (mx, my) = (sx / n, sy / n);
  let (mut cov, mut var) = (0.0, 0.0);
  for (x, y) in points {
    cov += (x - mx) * (y - my);
    var += (x - mx) * (x - mx);
  }
  if var == 0.0 {
    return (0.0, my);
  }
  let slope = cov / var;
  (slope, my - slope * mx)
}

/// Global model: key -> meta slot
/// 全局模型：键 -> 元数组槽位
#[derive(Clone, Copy, Debug, Default)]
pub struct MetaModel {
  pub key0: f64,
  pub slope: f64,
  pub intercept: f64,
}

impl MetaModel {
  /// Least squares over boundary keys against their rank, spread so the
  /// array ends up `density` full
  /// 对边界键与其秩做最小二乘，并按 `density` 目标占用率展开
  pub fn fit<K: Key>(keys: &[K], density: f64) -> Self {
    let key0 = keys.first().map_or(0.0, |k| k.as_f64());
    let (slope, intercept) = least_squares(
      keys
        .iter()
        .enumerate()
        .map(|(i, k)| (k.as_f64() - key0, i as f64)),
    );
    Self {
      key0,
      slope: slope / density,
      intercept: intercept / density,
    }
  }

  /// Cheap retrain: stretch the old model
  /// 廉价重训：拉伸旧模型
  pub fn extend(self, factor: f64) -> Self {
    Self {
      key0: self.key0,
      slope: self.slope * factor,
      intercept: self.intercept * factor,
    }
  }

  /// Single-point model, predictions carry no information
  /// 单点模型，预测不含信息
  #[inline]
  pub fn degenerate(&self) -> bool {
    self.slope == 0.0
  }

  #[inline]
  pub fn predict(&self, key: f64) -> isize {
    self.slope.mul_add(key - self.key0, self.intercept).floor() as isize
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entries(keys: &[u64]) -> Vec<Entry<u64, u64>> {
    keys.iter().map(|&k| Entry::new(k, 1)).collect()
  }

  #[test]
  fn linear_is_one_run() {
    let data = entries(&(0..1000).map(|i| i * 10).collect::<Vec<_>>());
    let runs = fit_runs(&data, 4, 1);
    assert_eq!(runs.len(), 1);
    assert!((runs[0].cone.slope() - 0.1).abs() < 1e-3);
  }

  #[test]
  fn error_bounded() {
    let keys: Vec<u64> = (0..2000u64).map(|i| i * i / 7 + i).collect();
    let data = entries(&keys);
    let eps = 8;
    for run in fit_runs(&data, eps, 1) {
      let k0 = data[run.range.start].key as f64;
      let slope = run.cone.slope();
      for (pos, i) in run.range.clone().enumerate() {
        let pred = slope * (data[i].key as f64 - k0);
        assert!((pred - pos as f64).abs() <= eps as f64 + 1e-6);
      }
    }
  }

  #[test]
  fn min_runs_respected() {
    let data = entries(&(0..100).collect::<Vec<_>>());
    assert!(fit_runs(&data, 16, 4).len() >= 4);
    assert_eq!(fit_runs(&data[..3], 16, 4).len(), 3);
  }

  #[test]
  fn cone_pad() {
    let mut cone = Cone::new(1);
    cone.push(10.0, 1);
    cone.push(20.0, 2);
    // key far ahead: needs a larger position
    match cone.check(100.0, 3) {
      Fit::Pad(p) => assert!((4..=5).contains(&p)),
      other => panic!("{other:?}"),
    }
    // keys too dense cannot be fixed by padding
    assert_eq!(cone.check(21.0, 9), Fit::No);
  }

  #[test]
  fn equal_keys_stay_together() {
    let mut keys = vec![1u64; 50];
    keys.extend(2..10);
    let data = entries(&keys);
    let runs = fit_runs(&data, 2, 4);
    for w in runs.windows(2) {
      let (a, b) = (&w[0].range, &w[1].range);
      assert_ne!(data[a.end - 1].key, data[b.start].key);
    }
    assert_eq!(runs.iter().map(|r| r.range.len()).sum::<usize>(), data.len());
  }

  #[test]
  fn equal_block_split_at_key_change() {
    let data = entries(&[1, 1, 1, 1, 2, 3]);
    let runs = fit_runs(&data, 2, 3);
    let ranges: Vec<_> = runs.iter().map(|r| r.range.clone()).collect();
    assert_eq!(ranges, [0..4, 4..5, 5..6]);
    // one distinct key cannot be cut
    assert_eq!(fit_runs(&data[..4], 2, 2).len(), 1);
  }

  #[test]
  fn ls_exact() {
    let (s, b) = least_squares([(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)].into_iter());
    assert!((s - 2.0).abs() < 1e-9 && (b - 1.0).abs() < 1e-9);
  }
}
