//! Slab of segments addressed by index
//! 按下标寻址的段存储池

/// Handle into an [`Arena`]
/// [`Arena`] 中的句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegId(u32);

#[derive(Debug)]
pub struct Arena<S> {
  slots: Vec<Option<S>>,
  free: Vec<u32>,
}

impl<S> Default for Arena<S> {
  fn default() -> Self {
    Self {
      slots: Vec::new(),
      free: Vec::new(),
    }
  }
}

impl<S> Arena<S> {
  pub fn alloc(&mut self, s: S) -> SegId {
    match self.free.pop() {
      Some(i) => {
        self.slots[i as usize] = Some(s);
        SegId(i)
      }
      None => {
        self.slots.push(Some(s));
        SegId((self.slots.len() - 1) as u32)
      }
    }
  }

  /// Take the value out, recycling its slot
  /// 取出值并回收槽位
  pub fn remove(&mut self, id: SegId) -> S {
    match self.slots[id.0 as usize].take() {
      Some(s) => {
        self.free.push(id.0);
        s
      }
      None => crate::error::fatal!("arena: double free of {id:?}"),
    }
  }

  #[inline]
  pub fn get(&self, id: SegId) -> &S {
    match &self.slots[id.0 as usize] {
      Some(s) => s,
      None => crate::error::fatal!("arena: dangling {id:?}"),
    }
  }

  /// `None` once the value was removed
  /// 值已被移除时为 `None`
  #[inline]
  pub fn try_get(&self, id: SegId) -> Option<&S> {
    self.slots.get(id.0 as usize).and_then(Option::as_ref)
  }

  #[inline]
  pub fn get_mut(&mut self, id: SegId) -> &mut S {
    match &mut self.slots[id.0 as usize] {
      Some(s) => s,
      None => crate::error::fatal!("arena: dangling {id:?}"),
    }
  }

  pub fn len(&self) -> usize {
    self.slots.len() - self.free.len()
  }

  pub fn values(&self) -> impl Iterator<Item = &S> {
    self.slots.iter().flatten()
  }
}
