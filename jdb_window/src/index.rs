//! Public sliding-window index
//! 公开的滑动窗口索引

use std::{mem::size_of, sync::Arc};

use log::{info, trace};

use crate::{
  Conf, Coord, Entry, Error, IndexContext, Key, Result, SearchBound, Segment, Ts,
  conf::RETRAIN_DENSITY,
  coord::{MetaThread, Rendezvous, RetrainCoordinator},
  error::fatal,
  meta::layout,
  model::{MetaModel, fit_runs},
  stats::{StatsSnapshot, bump},
};

/// Concurrent learned index over `(key, timestamp)` entries that forgets
/// entries older than `now - window`
///
/// 基于 `(键, 时间戳)` 条目的并发学习型索引，自动遗忘早于 `now - window` 的条目
///
/// Worker `tid` (`0..threads`) owns one partition of the key space. Every
/// operation is still correct from any worker: foreign keys are routed to
/// their owner.
///
/// 工作线程 `tid`（`0..threads`）拥有键空间的一个分区。任意线程调用均正确：
/// 不属于本分区的键会被路由到其所有者。
pub struct Index<K: Key, T: Ts> {
  ctx: Arc<IndexContext<K, T>>,
  coord: Box<dyn RetrainCoordinator<K, T>>,
}

impl<K: Key, T: Ts> Index<K, T> {
  /// Build from entries sorted by key. Timestamp `Ts::ZERO` is reserved.
  /// 由按键排序的条目构建。时间戳 `Ts::ZERO` 为保留值。
  pub fn build(conf: Conf, data: &[Entry<K, T>]) -> Result<Self> {
    Self::build_with(conf, data, |ctx| {
      let coord: Box<dyn RetrainCoordinator<K, T>> = match conf.coord {
        Coord::Rendezvous => Box::new(Rendezvous),
        Coord::MetaThread => Box::new(MetaThread::spawn(Arc::clone(ctx))?),
      };
      Ok(coord)
    })
  }

  /// Build with a custom coordinator
  /// 使用自定义协调者构建
  pub fn build_with<F>(conf: Conf, data: &[Entry<K, T>], coord: F) -> Result<Self>
  where
    F: FnOnce(&Arc<IndexContext<K, T>>) -> Result<Box<dyn RetrainCoordinator<K, T>>>,
  {
    conf.validate()?;
    check(data)?;
    let too_few = Error::TooFewKeys {
      keys: data.len(),
      threads: conf.threads,
    };
    if data.len() < conf.threads {
      return Err(too_few);
    }
    let runs = fit_runs(data, conf.error, conf.threads);
    if runs.len() < conf.threads {
      return Err(too_few);
    }

    let segs: Vec<Segment<K, T>> = runs
      .into_iter()
      .map(|r| Segment::new(&data[r.range], r.cone, conf.error))
      .collect();
    let keys: Vec<K> = segs.iter().map(Segment::key_start).collect();
    let (mut parts, route) = layout(segs, MetaModel::fit(&keys, RETRAIN_DENSITY), conf.threads);
    let watermark = data.iter().map(|e| e.ts).max().unwrap_or(T::ZERO);
    for p in &mut parts {
      p.watermark = watermark;
    }
    info!(
      "build: {} entries, {} segments, {} partitions, {:?}",
      data.len(),
      keys.len(),
      conf.threads,
      conf.coord
    );

    let ctx = Arc::new(IndexContext::new(conf, parts, route));
    let coord = coord(&ctx)?;
    Ok(Self { ctx, coord })
  }

  #[inline]
  fn check_tid(&self, tid: usize) {
    let threads = self.ctx.threads();
    if tid >= threads {
      fatal!("thread id {tid} out of range 0..{threads}");
    }
  }

  /// True if a live entry with `key` exists at `now`
  /// `now` 时刻存在键为 `key` 的存活条目时为真
  pub fn lookup(&self, tid: usize, key: K, now: T) -> bool {
    self.check_tid(tid);
    let hint = self.within_thread(tid, key).map(|b| (tid, b));
    let (found, retrain) = self.ctx.lookup(key, now, hint);
    if retrain {
      self.coord.retrain(&self.ctx);
    }
    found
  }

  /// Live entries with `lo <= key <= hi`, sorted by key
  /// `lo <= key <= hi` 的存活条目，按键排序
  pub fn range_query(&self, tid: usize, lo: K, now: T, hi: K) -> Vec<Entry<K, T>> {
    self.check_tid(tid);
    if lo > hi {
      return Vec::new();
    }
    let (out, retrain) = self.ctx.range(lo, hi, now);
    if retrain {
      self.coord.retrain(&self.ctx);
    }
    out
  }

  /// Number of live entries with `lo <= key <= hi`
  /// `lo <= key <= hi` 的存活条目数
  pub fn range_count(&self, tid: usize, lo: K, now: T, hi: K) -> usize {
    self.range_query(tid, lo, now, hi).len()
  }

  /// Insert `(key, now)`. Keys owned by another partition go through the
  /// coordinator.
  /// 插入 `(key, now)`。属于其他分区的键经由协调者处理。
  pub fn insert(&self, tid: usize, key: K, now: T) {
    self.check_tid(tid);
    if now == T::ZERO {
      fatal!("timestamp {now:?} is reserved for gaps");
    }
    let e = Entry::new(key, now);
    let owner = self.ctx.owner(key);
    if owner == tid {
      if self.ctx.insert(e) {
        self.coord.retrain(&self.ctx);
      }
    } else {
      trace!("insert {key:?} from {tid} forwarded to {owner}");
      bump(&self.ctx.stats.forwarded);
      self.coord.forward_insert(&self.ctx, e);
    }
  }

  /// Search window for `key` if worker `tid` owns it
  /// 若 `key` 属于工作线程 `tid`，返回其查找窗口
  pub fn within_thread(&self, tid: usize, key: K) -> Option<SearchBound> {
    let route = self.ctx.route.read();
    (route.owner(key) == tid).then(|| route.bound(tid, key))
  }

  /// Search window for `lo` if worker `tid` owns all of `[lo, hi]`
  /// 若工作线程 `tid` 拥有整个 `[lo, hi]`，返回 `lo` 的查找窗口
  pub fn within_thread_range(&self, tid: usize, lo: K, hi: K) -> Option<SearchBound> {
    let route = self.ctx.route.read();
    (lo <= hi && route.owner(lo) == tid && route.owner(hi) == tid).then(|| route.bound(tid, lo))
  }

  #[inline]
  pub fn owner(&self, key: K) -> usize {
    self.ctx.owner(key)
  }

  #[inline]
  pub fn threads(&self) -> usize {
    self.ctx.threads()
  }

  #[inline]
  pub fn conf(&self) -> &Conf {
    self.ctx.conf()
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.ctx.stats.snapshot()
  }

  /// Wait for forwarded inserts and requested retrains to finish
  /// 等待已转发的插入与已请求的重训完成
  pub fn sync(&self) {
    self.coord.sync();
  }

  /// Approximate heap and inline bytes
  /// 近似的堆与内联字节数
  pub fn memory_usage(&self) -> usize {
    let parts: usize = self.ctx.enter_all().iter().map(|p| p.mem_usage()).sum();
    let route = self.ctx.route.read();
    size_of::<Self>()
      + size_of::<IndexContext<K, T>>()
      + parts
      + route.starts.capacity() * size_of::<K>()
      + (route.bases.capacity() + route.lens.capacity()) * size_of::<usize>()
      + route.bounds.capacity() * size_of::<(usize, usize)>()
  }

  pub fn segment_count(&self) -> usize {
    self.ctx.enter_all().iter().map(|p| p.seg_count()).sum()
  }

  /// Boundary keys of all segments, following sibling links
  /// 沿兄弟链接得到的所有段边界键
  pub fn chain_keys(&self) -> Vec<K> {
    self
      .ctx
      .enter_all()
      .iter()
      .flat_map(|p| p.chain().map(Segment::key_start).collect::<Vec<_>>())
      .collect()
  }

  /// Boundary keys of partition `p`'s segments
  /// 分区 `p` 中各段的边界键
  pub fn partition_keys(&self, p: usize) -> Vec<K> {
    self.check_tid(p);
    self.ctx.enter(p).chain().map(Segment::key_start).collect()
  }

  /// Key range `[lo, hi)` of partition `p`, `None` is unbounded
  /// 分区 `p` 的键范围 `[lo, hi)`，`None` 表示无界
  pub fn partition_range(&self, p: usize) -> (Option<K>, Option<K>) {
    self.check_tid(p);
    let g = self.ctx.enter(p);
    (g.lo, g.hi)
  }

  /// Check every structural invariant
  /// 检查所有结构不变量
  pub fn verify(&self) -> Result<()> {
    let parts = self.ctx.enter_all();
    let route = self.ctx.route.read();
    let mut prev: Option<K> = None;
    for (p, g) in parts.iter().enumerate() {
      g.verify().map_err(Error::Corrupt)?;
      let lo = (p > 0).then(|| route.starts[p]);
      let hi = route.starts.get(p + 1).copied();
      if g.lo != lo || g.hi != hi {
        return Err(Error::Corrupt(format!("partition {p}: range disagrees with route")));
      }
      for key in g.chain().map(Segment::key_start) {
        if prev.is_some_and(|k| k >= key) {
          return Err(Error::Corrupt(format!(
            "partition {p}: boundary {key:?} out of order"
          )));
        }
        prev = Some(key);
      }
    }
    Ok(())
  }
}

fn check<K: Key, T: Ts>(data: &[Entry<K, T>]) -> Result<()> {
  if data.is_empty() {
    return Err(Error::EmptyData);
  }
  if let Some(pos) = data.iter().position(Entry::is_gap) {
    return Err(Error::GapTimestamp { pos });
  }
  if let Some(pos) = data.windows(2).position(|w| w[0].key > w[1].key) {
    return Err(Error::NotSorted { pos: pos + 1 });
  }
  Ok(())
}
