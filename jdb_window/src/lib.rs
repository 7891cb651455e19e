//! # Window Index: Concurrent Learned Index with Time Expiry
//! 窗口索引：带时间过期的并发学习型索引
//!
//! Keeps `(key, timestamp)` entries for a sliding window. Segments are gapped
//! arrays under a shrinking-cone model; a partitioned meta array routes keys
//! to segments, one partition per worker thread. Expired entries are reclaimed
//! lazily when an operation touches them.
//!
//! 为滑动窗口保存 `(键, 时间戳)` 条目。段是收缩锥模型下带空隙的数组；分区元数组
//! 将键路由到段，每个工作线程一个分区。过期条目在被操作触及时惰性回收。
//!
//! ## Usage / 使用方法
//!
//! ```rust
//! use jdb_window::{Conf, Entry, Index};
//!
//! let data: Vec<Entry<u64, u64>> = (0..1000).map(|k| Entry::new(k * 2, 10)).collect();
//! let conf = Conf { window: 100, threads: 2, ..Conf::default() };
//! let index = Index::build(conf, &data).unwrap();
//!
//! assert!(index.lookup(0, 20, 50));
//! // 10 < 200 - 100: expired
//! // 10 < 200 - 100：已过期
//! assert!(!index.lookup(0, 20, 200));
//!
//! index.insert(1, 1999, 150);
//! assert_eq!(index.range_count(1, 1990, 200, 2000), 1);
//! ```

mod arena;
mod bitmap;
mod conf;
mod coord;
mod ctx;
pub mod error;
mod index;
mod meta;
mod model;
mod search;
mod segment;
mod stats;
mod types;

pub use bitmap::Bitmap;
pub use conf::{Conf, Coord};
pub use coord::{MetaThread, Rendezvous, RetrainCoordinator};
pub use ctx::IndexContext;
pub use error::{Error, Result};
pub use index::Index;
pub use search::SearchBound;
pub use segment::{Segment, Update};
pub use stats::{Stats, StatsSnapshot};
pub use types::{Entry, Key, Ts};
