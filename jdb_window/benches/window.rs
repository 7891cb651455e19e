//! Criterion benchmark of window index lookups and inserts
//! Criterion 基准测试：窗口索引的查找与插入

use std::{hint::black_box, thread};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use jdb_window::{Conf, Coord, Entry, Index};
use rand::{Rng, SeedableRng, rngs::StdRng};

const SAMPLE_SIZE: usize = 20;
const DATA_SIZES: &[usize] = &[10_000, 100_000, 1_000_000];
const QUERIES: usize = 1000;
const SEED: u64 = 42;

/// Keys spaced by 4, all stamped 1
/// 间隔为 4 的键，时间戳均为 1
fn gen_data(size: usize) -> Vec<Entry<u64, u64>> {
  (0..size as u64).map(|k| Entry::new(k * 4, 1)).collect()
}

/// Random keys within the data range
/// 数据范围内的随机键
fn gen_queries(size: usize, count: usize) -> Vec<u64> {
  let mut rng = StdRng::seed_from_u64(SEED);
  (0..count)
    .map(|_| rng.random_range(0..size as u64 * 4))
    .collect()
}

fn conf(threads: usize, coord: Coord) -> Conf {
  Conf {
    window: u64::MAX / 2,
    threads,
    coord,
    ..Conf::default()
  }
}

fn bench_lookup(c: &mut Criterion) {
  let mut group = c.benchmark_group("lookup");
  group.sample_size(SAMPLE_SIZE);

  for &size in DATA_SIZES {
    let data = gen_data(size);
    let queries = gen_queries(size, QUERIES);
    let index = Index::build(conf(1, Coord::Rendezvous), &data).unwrap();
    group.throughput(Throughput::Elements(queries.len() as u64));
    group.bench_with_input(BenchmarkId::new("window", size), &queries, |b, queries| {
      b.iter(|| {
        for &q in queries {
          black_box(index.lookup(0, q, 2));
        }
      })
    });
  }
  group.finish();
}

fn bench_insert(c: &mut Criterion) {
  let mut group = c.benchmark_group("insert");
  group.sample_size(SAMPLE_SIZE);

  for &size in DATA_SIZES {
    let data = gen_data(size);
    let queries = gen_queries(size, QUERIES);
    for coord in [Coord::Rendezvous, Coord::MetaThread] {
      let index = Index::build(conf(1, coord), &data).unwrap();
      let mut now = 2u64;
      group.throughput(Throughput::Elements(queries.len() as u64));
      group.bench_with_input(
        BenchmarkId::new(format!("{coord:?}"), size),
        &queries,
        |b, queries| {
          b.iter(|| {
            now += 1;
            for &q in queries {
              // odd keys land between bulk keys
              index.insert(0, q | 1, now);
            }
          })
        },
      );
      index.sync();
    }
  }
  group.finish();
}

/// Every worker inserts and looks up in its own partition
/// 每个工作线程在自己的分区内插入与查找
fn bench_parallel(c: &mut Criterion) {
  const THREADS: usize = 4;
  let mut group = c.benchmark_group("parallel");
  group.sample_size(SAMPLE_SIZE);

  let size = 100_000;
  let data = gen_data(size);
  let index = Index::build(conf(THREADS, Coord::Rendezvous), &data).unwrap();
  let per: Vec<Vec<u64>> = (0..THREADS)
    .map(|t| {
      let (lo, hi) = index.partition_range(t);
      let lo = lo.unwrap_or(0);
      let hi = hi.unwrap_or(size as u64 * 4);
      let mut rng = StdRng::seed_from_u64(SEED + t as u64);
      (0..QUERIES).map(|_| rng.random_range(lo..hi)).collect()
    })
    .collect();

  group.throughput(Throughput::Elements((THREADS * QUERIES * 2) as u64));
  group.bench_function(BenchmarkId::new("mixed", THREADS), |b| {
    b.iter(|| {
      thread::scope(|s| {
        for (tid, keys) in per.iter().enumerate() {
          let index = &index;
          s.spawn(move || {
            for &k in keys {
              index.insert(tid, k | 1, 2);
              black_box(index.lookup(tid, k, 2));
            }
          });
        }
      });
    })
  });
  group.finish();
}

criterion_group!(benches, bench_lookup, bench_insert, bench_parallel);
criterion_main!(benches);
