//! Shadows: thin adapters that bind a host pointer-object to a strategy
//! instance and own the transition-on-store logic.
//!
//! Grounded in `spyvm/storage.py`'s `AbstractShadow` hierarchy -- the shadow,
//! not the strategy, decides *when* to generalize a representation; the
//! strategy only knows how to hold values once a representation is chosen.

use stvm_base::Result;
use tracing::trace;

use crate::error::{image_err, ImageErrorKind};
use crate::model::{Object, ObjectHandle};
use crate::space::Space;
use crate::strategy::{Strategy, StrategyKind};

/// The base adapter: one strategy instance, generalized in place whenever a
/// store no longer fits the current representation.
#[derive(Debug)]
pub struct StorageShadow {
    strategy: Strategy,
}

impl StorageShadow {
    pub fn new(strategy: Strategy) -> Self {
        StorageShadow { strategy }
    }

    pub fn fetch(&self, space: &Space, i: usize) -> Result<Object> {
        self.strategy.raw_fetch(space, i)
    }

    pub fn store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        if !self.strategy.check_can_handle(space, v) {
            self.transition(space, v)?;
        }
        self.strategy.raw_store(space, i, v)
    }

    pub fn size(&self) -> usize {
        self.strategy.size()
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn grow(&mut self, space: &Space, extra: usize) {
        self.strategy.grow(space, extra);
    }

    pub fn shrink(&mut self, by: usize) {
        self.strategy.shrink(by);
    }

    fn transition(&mut self, space: &Space, v: Object) -> Result<()> {
        let from = self.strategy.kind();
        let to = self.strategy.generalized_strategy_for(space, v);
        trace!(target: "stvm", ?from, ?to, "strategy transition");
        let mut generalized = Strategy::new_empty_in(space, to, self.strategy.size());
        self.strategy.copy_into(space, &mut generalized)?;
        self.strategy = generalized;
        Ok(())
    }
}

/// Wraps `List` storage with a version counter that increments on every
/// store. The shadow itself does not memoize `fetch` results -- callers key
/// their own caches off [`CachedObjectShadow::version`], as the design
/// prescribes.
#[derive(Debug)]
pub struct CachedObjectShadow {
    inner: StorageShadow,
    version: u64,
}

impl CachedObjectShadow {
    pub fn new(data: Vec<Object>) -> Self {
        CachedObjectShadow {
            inner: StorageShadow::new(Strategy::List { data }),
            version: 0,
        }
    }

    pub fn fetch(&self, space: &Space, i: usize) -> Result<Object> {
        self.inner.fetch(space, i)
    }

    pub fn store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        self.inner.store(space, i, v)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// At most one registered dependent. Every store bumps a notification
/// counter the dependent can poll; registering a second, distinct dependent
/// is rejected.
#[derive(Debug)]
pub struct ObserveeShadow {
    inner: StorageShadow,
    dependent: Option<ObjectHandle>,
    pending_updates: u64,
}

impl ObserveeShadow {
    pub fn new(strategy: Strategy) -> Self {
        ObserveeShadow {
            inner: StorageShadow::new(strategy),
            dependent: None,
            pending_updates: 0,
        }
    }

    pub fn register_dependent(&mut self, dependent: ObjectHandle) -> Result<()> {
        match self.dependent {
            None => {
                self.dependent = Some(dependent);
                Ok(())
            }
            Some(existing) if existing == dependent => Ok(()),
            Some(_) => Err(image_err(ImageErrorKind::TooManyObservers)),
        }
    }

    pub fn dependent(&self) -> Option<ObjectHandle> {
        self.dependent
    }

    pub fn fetch(&self, space: &Space, i: usize) -> Result<Object> {
        self.inner.fetch(space, i)
    }

    pub fn store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        self.inner.store(space, i, v)?;
        if self.dependent.is_some() {
            self.pending_updates += 1;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn take_pending_updates(&mut self) -> u64 {
        std::mem::take(&mut self.pending_updates)
    }
}

/// Declares a logical size independent of the backing storage's own size --
/// used where a sparse representation must still report a stable size to
/// callers.
#[derive(Debug)]
pub struct RedirectingShadow {
    inner: StorageShadow,
    declared_size: usize,
}

impl RedirectingShadow {
    pub fn new(strategy: Strategy, declared_size: usize) -> Self {
        RedirectingShadow {
            inner: StorageShadow::new(strategy),
            declared_size,
        }
    }

    pub fn fetch(&self, space: &Space, i: usize) -> Result<Object> {
        self.inner.fetch(space, i)
    }

    pub fn store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        self.inner.store(space, i, v)
    }

    pub fn size(&self) -> usize {
        self.declared_size
    }

    pub fn set_declared_size(&mut self, size: usize) {
        self.declared_size = size;
    }
}

#[derive(Debug)]
pub enum Shadow {
    Storage(StorageShadow),
    Cached(CachedObjectShadow),
    Observee(ObserveeShadow),
    Redirecting(RedirectingShadow),
}

impl Shadow {
    pub fn fetch(&self, space: &Space, i: usize) -> Result<Object> {
        match self {
            Shadow::Storage(s) => s.fetch(space, i),
            Shadow::Cached(s) => s.fetch(space, i),
            Shadow::Observee(s) => s.fetch(space, i),
            Shadow::Redirecting(s) => s.fetch(space, i),
        }
    }

    pub fn store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        match self {
            Shadow::Storage(s) => s.store(space, i, v),
            Shadow::Cached(s) => s.store(space, i, v),
            Shadow::Observee(s) => s.store(space, i, v),
            Shadow::Redirecting(s) => s.store(space, i, v),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Shadow::Storage(s) => s.size(),
            Shadow::Cached(s) => s.size(),
            Shadow::Observee(s) => s.size(),
            Shadow::Redirecting(s) => s.size(),
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self.kind(), StrategyKind::WeakList)
    }

    fn kind(&self) -> StrategyKind {
        match self {
            Shadow::Storage(s) => s.kind(),
            Shadow::Cached(_) => StrategyKind::List,
            Shadow::Observee(s) => s.inner.kind(),
            Shadow::Redirecting(s) => s.inner.kind(),
        }
    }
}
