//! Key, timestamp and entry types
//! 键、时间戳与条目类型

#![allow(clippy::cast_precision_loss, clippy::cast_lossless)]

use std::fmt::Debug;

/// Key trait for supported types
/// 支持的键类型约束
pub trait Key: Copy + Send + Sync + Ord + Debug + Default + 'static {
  /// Convert to f64
  /// 转换为 f64
  fn as_f64(self) -> f64;
}

/// Timestamp trait. `ZERO` is reserved as the gap sentinel.
/// 时间戳约束。`ZERO` 保留为空隙哨兵值。
pub trait Ts: Copy + Send + Sync + Ord + Debug + Default + 'static {
  const ZERO: Self;

  /// `self - window`, saturating at the type minimum
  /// `self - window`，在类型最小值处饱和
  fn expiry(self, window: u64) -> Self;
}

macro_rules! impl_key {
  ($($t:ty),*) => {
    $(
      impl Key for $t {
        #[inline(always)]
        fn as_f64(self) -> f64 {
          self as f64
        }
      }
    )*
  };
}

impl_key!(
  u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize
);

macro_rules! impl_ts {
  ($($t:ty),*) => {
    $(
      impl Ts for $t {
        const ZERO: Self = 0;

        #[inline(always)]
        fn expiry(self, window: u64) -> Self {
          match <$t>::try_from(window) {
            Ok(w) => self.saturating_sub(w),
            Err(_) => <$t>::MIN,
          }
        }
      }
    )*
  };
}

impl_ts!(
  u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize
);

/// A `(key, timestamp)` pair
/// 一个 `(键, 时间戳)` 对
#[cfg_attr(feature = "bitcode", derive(bitcode::Encode, bitcode::Decode))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Entry<K, T> {
  pub key: K,
  pub ts: T,
}

impl<K: Key, T: Ts> Entry<K, T> {
  #[inline(always)]
  pub const fn new(key: K, ts: T) -> Self {
    Self { key, ts }
  }

  /// Gap slot: keeps its key for ordering, timestamp is `Ts::ZERO`
  /// 空隙槽位：保留键以维持有序，时间戳为 `Ts::ZERO`
  #[inline(always)]
  pub(crate) fn gap(key: K) -> Self {
    Self { key, ts: T::ZERO }
  }

  #[inline(always)]
  pub fn is_gap(&self) -> bool {
    self.ts == T::ZERO
  }

  /// Live at `expiry` (= now - WINDOW)
  /// 在 `expiry`（= now - WINDOW）时刻存活
  #[inline(always)]
  pub fn is_live(&self, expiry: T) -> bool {
    !self.is_gap() && self.ts >= expiry
  }
}

impl<K: Key, T: Ts> From<(K, T)> for Entry<K, T> {
  #[inline]
  fn from((key, ts): (K, T)) -> Self {
    Self { key, ts }
  }
}
