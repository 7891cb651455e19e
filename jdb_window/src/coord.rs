//! Who performs cross-partition work
//! 由谁执行跨分区工作
//!
//! [`Rendezvous`] lets the calling worker take the needed locks itself.
//! [`MetaThread`] hands the work to one coordinator thread over a channel, so
//! workers never block on partitions they do not own.
//!
//! [`Rendezvous`] 由调用线程自行获取所需的锁。[`MetaThread`] 通过通道把工作交给
//! 单个协调线程，工作线程不会阻塞在不属于自己的分区上。

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
};

use crossbeam::channel::{Sender, bounded, unbounded};
use log::{debug, error};

use crate::{Entry, IndexContext, Key, Ts, error::fatal};

pub trait RetrainCoordinator<K: Key, T: Ts>: Send + Sync {
  /// Deliver an insert whose key another partition owns
  /// 投递键归属于其他分区的插入
  fn forward_insert(&self, ctx: &Arc<IndexContext<K, T>>, e: Entry<K, T>);

  /// A partition asked for a meta retrain
  /// 某分区请求元重训
  fn retrain(&self, ctx: &Arc<IndexContext<K, T>>);

  /// Block until all work handed over so far has been applied
  /// 阻塞直到此前移交的工作全部完成
  fn sync(&self) {}
}

/// Inline coordination on the calling thread
/// 在调用线程上内联协调
#[derive(Debug, Default)]
pub struct Rendezvous;

impl<K: Key, T: Ts> RetrainCoordinator<K, T> for Rendezvous {
  fn forward_insert(&self, ctx: &Arc<IndexContext<K, T>>, e: Entry<K, T>) {
    if ctx.insert(e) {
      ctx.meta_retrain();
    }
  }

  fn retrain(&self, ctx: &Arc<IndexContext<K, T>>) {
    ctx.meta_retrain();
  }
}

enum Task<K, T> {
  Insert(Entry<K, T>),
  Retrain,
  Sync(Sender<()>),
}

/// Dedicated coordinator thread fed by an unbounded queue
/// 由无界队列驱动的专用协调线程
pub struct MetaThread<K, T> {
  tx: Option<Sender<Task<K, T>>>,
  pending: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl<K: Key, T: Ts> MetaThread<K, T> {
  pub fn spawn(ctx: Arc<IndexContext<K, T>>) -> std::io::Result<Self> {
    let (tx, rx) = unbounded::<Task<K, T>>();
    let pending = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&pending);
    let handle = thread::Builder::new()
      .name("window_meta".into())
      .spawn(move || {
        for task in rx {
          match task {
            Task::Insert(e) => {
              if ctx.insert(e) {
                ctx.meta_retrain();
              }
            }
            Task::Retrain => {
              flag.store(false, Ordering::Release);
              ctx.meta_retrain();
            }
            Task::Sync(ack) => {
              let _ = ack.send(());
            }
          }
        }
        debug!("meta thread stopped");
      })?;
    Ok(Self {
      tx: Some(tx),
      pending,
      handle: Some(handle),
    })
  }

  fn send(&self, task: Task<K, T>) {
    let Some(tx) = &self.tx else {
      return;
    };
    if tx.send(task).is_err() {
      fatal!("meta thread is gone");
    }
  }
}

impl<K: Key, T: Ts> RetrainCoordinator<K, T> for MetaThread<K, T> {
  fn forward_insert(&self, _: &Arc<IndexContext<K, T>>, e: Entry<K, T>) {
    self.send(Task::Insert(e));
  }

  fn retrain(&self, _: &Arc<IndexContext<K, T>>) {
    // one queued request is enough
    if !self.pending.swap(true, Ordering::AcqRel) {
      self.send(Task::Retrain);
    }
  }

  fn sync(&self) {
    let (tx, rx) = bounded(1);
    self.send(Task::Sync(tx));
    let _ = rx.recv();
  }
}

impl<K, T> Drop for MetaThread<K, T> {
  fn drop(&mut self) {
    drop(self.tx.take());
    if let Some(h) = self.handle.take() {
      if h.join().is_err() {
        error!("meta thread panicked");
      }
    }
  }
}
