//! Single-threaded behavior of the window index
//! 窗口索引单线程行为测试

use aok::{OK, Void};
use jdb_window::{Conf, Entry, Error, Index};
use log::info;

#[static_init::constructor(0)]
extern "C" fn _log_init() {
  log_init::init();
}

fn entries(pairs: impl IntoIterator<Item = (u64, u64)>) -> Vec<Entry<u64, u64>> {
  pairs.into_iter().map(Entry::from).collect()
}

/// keys 0, 10, .., 90 stamped 1..=10
fn small() -> Vec<Entry<u64, u64>> {
  entries((0..10).map(|i| (i * 10, i + 1)))
}

fn small_conf() -> Conf {
  Conf {
    window: 5,
    threads: 1,
    ..Conf::default()
  }
}

#[test]
fn test_lookup_respects_window() -> Void {
  let index = Index::build(small_conf(), &small())?;
  // now 10, expiry 5
  assert!(index.lookup(0, 90, 10));
  assert!(index.lookup(0, 40, 10));
  assert!(!index.lookup(0, 0, 10));
  assert!(!index.lookup(0, 30, 10));
  assert!(!index.lookup(0, 95, 10));
  index.verify()?;
  OK
}

#[test]
fn test_insert_then_range() -> Void {
  let index = Index::build(small_conf(), &small())?;
  index.insert(0, 95, 11);
  // expiry 6: keys stamped below 6 are gone
  let keys: Vec<u64> = index.range_query(0, 0, 11, 100).iter().map(|e| e.key).collect();
  assert_eq!(keys, [50, 60, 70, 80, 90, 95]);
  assert_eq!(index.range_count(0, 0, 11, 100), 6);
  assert_eq!(index.range_count(0, 91, 11, 100), 1);
  assert_eq!(index.range_count(0, 60, 11, 50), 0);
  assert!(index.lookup(0, 95, 11));
  index.verify()?;
  OK
}

#[test]
fn test_overflow_signals_once() -> Void {
  let conf = Conf {
    window: 1_000_000,
    max_buffer: 200,
    threads: 1,
    ..Conf::default()
  };
  let data = entries((0..=100).map(|i| (i * 1000, 1)));
  let index = Index::build(conf, &data)?;
  assert_eq!(index.segment_count(), 1);

  let keys: Vec<u64> = (50_001..=50_300).collect();
  for &k in &keys {
    index.insert(0, k, 2);
  }
  let stats = index.stats();
  info!("{stats:?}");
  // the first report flags the segment, the next one merges it
  assert_eq!(stats.retrain_signals, 1);
  assert_eq!(stats.absorbed, 1);
  assert_eq!(stats.seg_retrains, 1);
  assert!(index.segment_count() > 1);

  for &k in &keys {
    assert!(index.lookup(0, k, 3), "key {k}");
  }
  for e in &data {
    assert!(index.lookup(0, e.key, 3), "key {}", e.key);
  }
  assert_eq!(index.range_count(0, 50_000, 3, 51_000), keys.len() + 2);
  index.verify()?;
  OK
}

#[test]
fn test_boundary_key_owned_once() -> Void {
  let conf = Conf {
    window: 1000,
    threads: 2,
    ..Conf::default()
  };
  let data = entries((0..200).map(|i| (i * 7, 1)));
  let index = Index::build(conf, &data)?;

  let (lo, hi) = index.partition_range(1);
  let boundary = lo.unwrap();
  assert_eq!(hi, None);
  assert_eq!(index.partition_range(0), (None, Some(boundary)));

  index.insert(1, boundary, 5);
  let owners: Vec<usize> = (0..2)
    .filter(|&t| index.within_thread(t, boundary).is_some())
    .collect();
  assert_eq!(owners, [1]);
  assert_eq!(index.owner(boundary), 1);
  assert_eq!(index.owner(boundary - 1), 0);
  // any worker sees it
  assert!(index.lookup(0, boundary, 5));
  assert!(index.lookup(1, boundary, 5));

  // a range hint is the window of its lower end
  let hint = index.within_thread_range(0, 0, boundary - 1);
  assert!(hint.is_some());
  assert_eq!(hint, index.within_thread(0, 0));
  assert!(index.within_thread_range(0, 0, boundary).is_none());
  assert!(index.within_thread_range(1, boundary + 1, boundary).is_none());
  assert!(index.within_thread_range(1, boundary, boundary + 70).is_some());
  index.verify()?;
  OK
}

#[test]
fn test_foreign_insert_is_forwarded() -> Void {
  let conf = Conf {
    window: 1000,
    threads: 2,
    ..Conf::default()
  };
  let data = entries((0..200).map(|i| (i * 7, 1)));
  let index = Index::build(conf, &data)?;
  let key = 3;
  assert_eq!(index.owner(key), 0);
  index.insert(1, key, 2);
  index.sync();
  assert_eq!(index.stats().forwarded, 1);
  assert!(index.lookup(1, key, 2));
  OK
}

#[test]
fn test_build_errors() -> Void {
  let conf = Conf::default();
  let empty: Vec<Entry<u64, u64>> = vec![];
  assert!(matches!(Index::build(conf, &empty), Err(Error::EmptyData)));

  let unsorted = entries([(1, 1), (5, 1), (3, 1)]);
  assert!(matches!(
    Index::build(conf, &unsorted),
    Err(Error::NotSorted { pos: 2 })
  ));

  let gap = entries([(1, 1), (2, 0)]);
  assert!(matches!(
    Index::build(conf, &gap),
    Err(Error::GapTimestamp { pos: 1 })
  ));

  let zero = Conf {
    threads: 0,
    ..conf
  };
  assert!(matches!(
    Index::build(zero, &small()),
    Err(Error::InvalidConf(_))
  ));

  let many = Conf {
    threads: 20,
    ..conf
  };
  assert!(matches!(
    Index::build(many, &small()),
    Err(Error::TooFewKeys { keys: 10, threads: 20 })
  ));

  // one distinct key cannot make two partitions
  let dup = entries((0..50).map(|_| (7, 1)));
  let two = Conf {
    threads: 2,
    ..conf
  };
  assert!(matches!(
    Index::build(two, &dup),
    Err(Error::TooFewKeys { .. })
  ));
  OK
}

#[test]
fn test_equal_key_block_still_partitions() -> Void {
  let data = entries([(1, 1), (1, 2), (1, 3), (1, 4), (2, 1), (3, 1)]);
  let conf = Conf {
    threads: 3,
    ..Conf::default()
  };
  let index = Index::build(conf, &data)?;
  assert_eq!(index.segment_count(), 3);
  assert_eq!((index.owner(1), index.owner(2), index.owner(3)), (0, 1, 2));
  assert_eq!(index.range_count(0, 0, 5, 10), 6);
  assert_eq!(index.range_count(2, 1, 5, 1), 4);
  for (tid, k) in [(0, 1), (1, 2), (2, 3)] {
    assert!(index.lookup(tid, k, 5));
    assert!(index.within_thread(tid, k).is_some());
  }
  index.verify()?;
  OK
}

#[test]
fn test_duplicate_keys() -> Void {
  let data = entries([(1, 5), (2, 5), (2, 6), (2, 7), (3, 5)]);
  let index = Index::build(Conf::default(), &data)?;
  assert!(index.lookup(0, 2, 10));
  assert_eq!(index.range_count(0, 2, 10, 2), 3);
  index.insert(0, 2, 20);
  assert_eq!(index.range_count(0, 2, 20, 2), 4);
  // window 1000: only the copy stamped 20 survives at 1019
  assert_eq!(index.range_count(0, 0, 1019, 10), 1);
  assert!(index.lookup(0, 2, 1019));
  assert!(!index.lookup(0, 1, 1019));
  index.verify()?;
  OK
}

#[test]
fn test_everything_expires() -> Void {
  let conf = Conf {
    window: 10,
    threads: 2,
    ..Conf::default()
  };
  let data = entries((0..1000).map(|i| (i, 1)));
  let index = Index::build(conf, &data)?;
  assert_eq!(index.range_count(0, 0, 100, 1000), 0);
  for k in 0..1000 {
    assert!(!index.lookup(0, k, 100));
  }
  // partitions keep one segment each
  assert!(index.segment_count() >= 2);
  index.verify()?;

  for k in (0..1000).step_by(3) {
    index.insert(0, k, 200);
  }
  index.sync();
  assert_eq!(index.range_count(0, 0, 205, 1000), 334);
  assert!(index.lookup(1, 999, 205));
  assert!(!index.lookup(1, 998, 205));
  index.verify()?;
  OK
}

#[test]
fn test_streaming_keys_split() -> Void {
  let conf = Conf {
    window: 1_000_000,
    error: 4,
    max_error: 8,
    threads: 1,
    ..Conf::default()
  };
  let data = entries((0..100).map(|i| (i, 1)));
  let index = Index::build(conf, &data)?;
  // widening jumps cannot be padded within max_error
  let mut k = 100u64;
  for step in 1..300u64 {
    k += step * step;
    index.insert(0, k, 2);
  }
  assert!(index.stats().splits > 0);
  let chain = index.chain_keys();
  assert!(chain.windows(2).all(|w| w[0] < w[1]));
  assert_eq!(chain.len(), index.segment_count());
  assert_eq!(index.range_count(0, 0, 3, u64::MAX), 399);
  index.verify()?;
  OK
}

#[test]
fn test_memory_and_introspection() -> Void {
  let conf = Conf {
    threads: 3,
    ..Conf::default()
  };
  let data = entries((0..3000).map(|i| (i * 3, 1)));
  let index = Index::build(conf, &data)?;
  assert!(index.memory_usage() > data.len() * size_of::<Entry<u64, u64>>());
  assert_eq!(index.threads(), 3);
  assert_eq!(index.conf().threads, 3);

  let mut all = Vec::new();
  for p in 0..3 {
    let keys = index.partition_keys(p);
    assert!(!keys.is_empty());
    all.extend(keys);
  }
  assert_eq!(all, index.chain_keys());
  OK
}
