//! Index configuration and fixed tuning constants
//! 索引配置与固定调优常量

use crate::{Error, Result};

/// Hard cap of the meta model error before a retrain is forced
/// 强制重训前元模型误差的硬上限
pub const MAX_META_ERROR: usize = 8192;

/// Meta error cap = min(MAX_META_ERROR, ceil(factor * segment count))
/// 元误差上限 = min(MAX_META_ERROR, ceil(系数 * 段数))
pub const META_ERROR_FACTOR: f64 = 0.6;

/// Live occupancy below this triggers a retrain
/// 存活占用率低于此值触发重训
pub const MIN_OCCUPANCY: f64 = 0.5;

/// Meta occupancy above this triggers an extend
/// 元数组占用率高于此值触发扩展
pub const MAX_OCCUPANCY: f64 = 0.8;

/// Target occupancy of the meta array after a full retrain
/// 完全重训后元数组的目标占用率
pub const RETRAIN_DENSITY: f64 = 0.7;

/// Slope multiplier of an extend retrain
/// 扩展重训的斜率倍数
pub const EXTEND_FACTOR: f64 = 1.25;

/// Occupancy triggers are ignored below these sizes
/// 低于此规模时忽略占用率触发
pub const MIN_SEG_RETRAIN_LEN: usize = 16;
pub const MIN_META_RETRAIN_SLOTS: usize = 16;

/// Coordination strategy for cross-partition work
/// 跨分区工作的协调策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Coord {
  /// Calling thread takes the locks itself / 调用线程自行加锁
  #[default]
  Rendezvous,
  /// Dedicated coordinator thread fed by a queue / 由队列驱动的专用协调线程
  MetaThread,
}

/// Index configuration
/// 索引配置
#[derive(Clone, Copy, Debug)]
pub struct Conf {
  /// Retention horizon in timestamp units / 保留时长（时间戳单位）
  pub window: u64,
  /// Overflow buffer cap before a forced retrain / 强制重训前溢出缓冲上限
  pub max_buffer: usize,
  /// Model error bound ε / 模型误差界 ε
  pub error: usize,
  /// Segment shift budget / 段移位预算
  pub max_error: usize,
  /// Worker threads, one partition each / 工作线程数，每线程一个分区
  pub threads: usize,
  pub coord: Coord,
}

impl Default for Conf {
  fn default() -> Self {
    Self {
      window: 1000,
      max_buffer: 256,
      error: 16,
      max_error: 64,
      threads: 1,
      coord: Coord::Rendezvous,
    }
  }
}

impl Conf {
  pub fn validate(&self) -> Result<()> {
    if self.threads == 0 {
      return Err(Error::InvalidConf("threads must be > 0"));
    }
    if self.error == 0 {
      return Err(Error::InvalidConf("error must be > 0"));
    }
    if self.max_error < self.error {
      return Err(Error::InvalidConf("max_error must be >= error"));
    }
    if self.max_buffer == 0 {
      return Err(Error::InvalidConf("max_buffer must be > 0"));
    }
    Ok(())
  }
}
