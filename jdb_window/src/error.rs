//! Error definitions for the window index
//! 窗口索引错误定义

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
  #[error("data cannot be empty / 数据不能为空")]
  EmptyData,

  #[error("data must be sorted by key, violated at {pos} / 数据必须按键排序，位置 {pos} 违反")]
  NotSorted { pos: usize },

  #[error("timestamp 0 is reserved for gaps, found at {pos} / 时间戳 0 保留给空隙，位置 {pos}")]
  GapTimestamp { pos: usize },

  #[error("invalid conf: {0} / 配置无效")]
  InvalidConf(&'static str),

  #[error("{keys} keys cannot fill {threads} partitions / {keys} 个键无法填满 {threads} 个分区")]
  TooFewKeys { keys: usize, threads: usize },

  #[error("corrupt index: {0} / 索引损坏")]
  Corrupt(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Log and abort on a broken invariant. Continuing would corrupt routing.
/// 不变量被破坏时记录日志并中止，继续运行会破坏路由。
macro_rules! fatal {
  ($($arg:tt)*) => {{
    log::error!($($arg)*);
    std::process::abort()
  }};
}

pub(crate) use fatal;
