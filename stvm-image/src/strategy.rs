//! The storage strategy engine: a closed set of representations for an
//! object's indexed slots, plus the transition lattice that generalizes a
//! representation when a store no longer fits it.
//!
//! Modeled as a tagged enum rather than `dyn Strategy` trait objects, per the
//! design's explicit call to avoid open-world class hierarchies for a small
//! closed set -- mirrors `rstrategies.py`'s `StrategyFactory`/
//! `AbstractStrategy` without the open-ended subclassing Python allows.

use stvm_base::Result;

use crate::error::{image_err, ImageErrorKind};
use crate::model::{Object, ObjectHandle};
use crate::space::Space;

const SMALL_INT_NIL_TAG: i64 = i64::MAX;
const FLOAT_NIL_TAG: f64 = f64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    AllNil,
    SmallIntOrNil,
    FloatOrNil,
    List,
    WeakList,
}

impl StrategyKind {
    /// The lattice: which kinds a store that doesn't fit the current kind
    /// may generalize into, tried in order. `List` always matches, so it
    /// terminates every chain.
    pub fn transitions(self) -> &'static [StrategyKind] {
        match self {
            StrategyKind::AllNil => &[
                StrategyKind::SmallIntOrNil,
                StrategyKind::FloatOrNil,
                StrategyKind::List,
            ],
            StrategyKind::SmallIntOrNil => &[StrategyKind::List],
            StrategyKind::FloatOrNil => &[StrategyKind::List],
            StrategyKind::List => &[],
            StrategyKind::WeakList => &[],
        }
    }
}

#[derive(Debug)]
pub enum Strategy {
    AllNil { size: usize },
    SmallIntOrNil { data: Vec<i64> },
    FloatOrNil { data: Vec<f64> },
    List { data: Vec<Object> },
    WeakList { data: Vec<Option<ObjectHandle>> },
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::AllNil { .. } => StrategyKind::AllNil,
            Strategy::SmallIntOrNil { .. } => StrategyKind::SmallIntOrNil,
            Strategy::FloatOrNil { .. } => StrategyKind::FloatOrNil,
            Strategy::List { .. } => StrategyKind::List,
            Strategy::WeakList { .. } => StrategyKind::WeakList,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Strategy::AllNil { size } => *size,
            Strategy::SmallIntOrNil { data } => data.len(),
            Strategy::FloatOrNil { data } => data.len(),
            Strategy::List { data } => data.len(),
            Strategy::WeakList { data } => data.len(),
        }
    }

    pub fn new_empty(kind: StrategyKind, size: usize) -> Strategy {
        match kind {
            StrategyKind::AllNil => Strategy::AllNil { size },
            StrategyKind::SmallIntOrNil => Strategy::SmallIntOrNil {
                data: vec![SMALL_INT_NIL_TAG; size],
            },
            StrategyKind::FloatOrNil => Strategy::FloatOrNil {
                data: vec![FLOAT_NIL_TAG; size],
            },
            StrategyKind::List => Strategy::List {
                data: vec![Object::Pointer(ObjectHandle(space_nil_placeholder())); size],
            },
            StrategyKind::WeakList => Strategy::WeakList { data: vec![None; size] },
        }
    }

    /// `List`'s default fill needs a concrete nil handle, which only `Space`
    /// knows; callers must immediately overwrite placeholders with
    /// `Space::w_nil()` via [`Strategy::new_empty_in`].
    pub fn new_empty_in(space: &Space, kind: StrategyKind, size: usize) -> Strategy {
        let mut s = Self::new_empty(kind, size);
        if let Strategy::List { data } = &mut s {
            let nil = space.w_nil();
            data.iter_mut().for_each(|slot| *slot = nil);
        }
        s
    }

    pub fn check_can_handle(&self, space: &Space, v: Object) -> bool {
        match self {
            Strategy::AllNil { .. } => space.is_nil(v),
            Strategy::SmallIntOrNil { .. } => {
                space.is_nil(v)
                    || matches!(v.as_small_integer(), Some(i) if i != SMALL_INT_NIL_TAG)
            }
            Strategy::FloatOrNil { .. } => {
                space.is_nil(v)
                    || matches!(space.unwrap_float(v), Some(f) if f != FLOAT_NIL_TAG)
            }
            Strategy::List { .. } => true,
            Strategy::WeakList { .. } => true,
        }
    }

    /// The next, more general kind that can accommodate `v`, scanning this
    /// strategy's transition set in declared order.
    pub fn generalized_strategy_for(&self, space: &Space, v: Object) -> StrategyKind {
        for candidate in self.kind().transitions() {
            let probe = Strategy::new_empty(*candidate, 0);
            if probe.check_can_handle(space, v) {
                return *candidate;
            }
        }
        StrategyKind::List
    }

    fn bounds_check(&self, i: usize) -> Result<()> {
        if i >= self.size() {
            return Err(image_err(ImageErrorKind::StorageMismatch {
                expected: "in-bounds index",
                index: i,
            }));
        }
        Ok(())
    }

    pub fn raw_fetch(&self, space: &Space, i: usize) -> Result<Object> {
        self.bounds_check(i)?;
        Ok(match self {
            Strategy::AllNil { .. } => space.w_nil(),
            Strategy::SmallIntOrNil { data } => {
                let raw = data[i];
                if raw == SMALL_INT_NIL_TAG {
                    space.w_nil()
                } else {
                    Object::SmallInteger(raw)
                }
            }
            Strategy::FloatOrNil { data } => {
                let raw = data[i];
                if raw == FLOAT_NIL_TAG {
                    space.w_nil()
                } else {
                    space.wrap_float(raw)
                }
            }
            Strategy::List { data } => data[i],
            Strategy::WeakList { data } => match data[i] {
                Some(handle) if space.is_live(handle) => Object::Pointer(handle),
                _ => space.w_nil(),
            },
        })
    }

    /// Stores `v` assuming `check_can_handle(space, v)` already holds.
    /// Callers (the shadow) are responsible for transitioning first.
    pub fn raw_store(&mut self, space: &Space, i: usize, v: Object) -> Result<()> {
        self.bounds_check(i)?;
        match self {
            Strategy::AllNil { .. } => {
                debug_assert!(space.is_nil(v));
            }
            Strategy::SmallIntOrNil { data } => {
                data[i] = if space.is_nil(v) {
                    SMALL_INT_NIL_TAG
                } else {
                    v.as_small_integer().expect("checked by check_can_handle")
                };
            }
            Strategy::FloatOrNil { data } => {
                data[i] = if space.is_nil(v) {
                    FLOAT_NIL_TAG
                } else {
                    space.unwrap_float(v).expect("checked by check_can_handle")
                };
            }
            Strategy::List { data } => data[i] = v,
            Strategy::WeakList { data } => data[i] = v.as_handle(),
        }
        Ok(())
    }

    pub fn grow(&mut self, space: &Space, extra: usize) {
        match self {
            Strategy::AllNil { size } => *size += extra,
            Strategy::SmallIntOrNil { data } => data.resize(data.len() + extra, SMALL_INT_NIL_TAG),
            Strategy::FloatOrNil { data } => data.resize(data.len() + extra, FLOAT_NIL_TAG),
            Strategy::List { data } => {
                let nil = space.w_nil();
                data.resize(data.len() + extra, nil);
            }
            Strategy::WeakList { data } => data.resize(data.len() + extra, None),
        }
    }

    pub fn shrink(&mut self, by: usize) {
        match self {
            Strategy::AllNil { size } => *size = size.saturating_sub(by),
            Strategy::SmallIntOrNil { data } => data.truncate(data.len().saturating_sub(by)),
            Strategy::FloatOrNil { data } => data.truncate(data.len().saturating_sub(by)),
            Strategy::List { data } => data.truncate(data.len().saturating_sub(by)),
            Strategy::WeakList { data } => data.truncate(data.len().saturating_sub(by)),
        }
    }

    /// Discriminated copy selected by the *source* kind (`self`), per the
    /// design's visitor/double-dispatch note: from-`AllNil` is a no-op since
    /// a freshly created destination's defaults already align with it,
    /// every other source falls back to element-wise copy.
    pub fn copy_into(&self, space: &Space, dest: &mut Strategy) -> Result<()> {
        if matches!(self, Strategy::AllNil { .. }) {
            return Ok(());
        }
        for i in 0..self.size() {
            let v = self.raw_fetch(space, i)?;
            dest.raw_store(space, i, v)?;
        }
        Ok(())
    }
}

/// Placeholder index used only transiently by [`Strategy::new_empty`] before
/// a `Space`-aware caller overwrites it; never observed outside this module.
fn space_nil_placeholder() -> usize {
    usize::MAX
}

pub struct StrategyFactory;

impl StrategyFactory {
    /// The most specialized kind that can hold every value in `objects`,
    /// or `WeakList`/`List` as dictated by `weak`/global disablement.
    pub fn strategy_type_for(space: &Space, objects: &[Object], weak: bool) -> StrategyKind {
        if weak {
            return StrategyKind::WeakList;
        }
        if space.flags().no_specialized_storage {
            return StrategyKind::List;
        }
        let candidates = [
            StrategyKind::AllNil,
            StrategyKind::SmallIntOrNil,
            StrategyKind::FloatOrNil,
        ];
        'candidate: for kind in candidates {
            let probe = Strategy::new_empty(kind, 0);
            for &v in objects {
                if !probe.check_can_handle(space, v) {
                    continue 'candidate;
                }
            }
            return kind;
        }
        StrategyKind::List
    }

    pub fn empty_storage(space: &Space, size: usize, weak: bool) -> Strategy {
        if weak {
            return Strategy::new_empty(StrategyKind::WeakList, size);
        }
        if space.flags().no_specialized_storage {
            return Strategy::new_empty_in(space, StrategyKind::List, size);
        }
        Strategy::new_empty(StrategyKind::AllNil, size)
    }
}
