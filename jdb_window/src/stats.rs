//! Operation counters
//! 操作计数器

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

macro_rules! counters {
  ($($name:ident),* $(,)?) => {
    /// Relaxed counters shared by all partitions
    /// 所有分区共享的宽松计数器
    #[derive(Debug, Default)]
    pub struct Stats {
      $(pub(crate) $name: AtomicU64,)*
    }

    /// Point-in-time copy of [`Stats`]
    /// [`Stats`] 的时间点快照
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StatsSnapshot {
      $(pub $name: u64,)*
    }

    impl Stats {
      pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
          $($name: self.$name.load(Relaxed),)*
        }
      }
    }
  };
}

counters!(
  retrain_signals,
  absorbed,
  seg_retrains,
  meta_extends,
  meta_fulls,
  deletes,
  replaces,
  splits,
  queued,
  forwarded,
);

#[inline(always)]
pub(crate) fn bump(c: &AtomicU64) {
  c.fetch_add(1, Relaxed);
}
