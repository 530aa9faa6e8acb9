//! Typed per-session attribute bag.
//!
//! Codecs keep decode state here (an accumulation buffer, a partial header)
//! and handlers keep per-session scratch. Keys carry the value type, so a
//! lookup can only ever see the type it was stored with.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

/// A typed attribute key. Declare one per attribute, usually as a `static`:
///
/// ```
/// use bytes::BytesMut;
/// use seine_core::AttrKey;
///
/// static DECODE_BUF: AttrKey<BytesMut> = AttrKey::new("line.decode_buf");
/// ```
pub struct AttrKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: 'static> AttrKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn id(&self) -> (&'static str, TypeId) {
        (self.name, TypeId::of::<T>())
    }
}

/// Name-and-type keyed heterogeneous map. The session wraps it in a
/// read/write lock.
#[derive(Default)]
pub(crate) struct AttrMap {
    entries: HashMap<(&'static str, TypeId), Box<dyn Any + Send + Sync>>,
}

impl AttrMap {
    pub(crate) fn get<T>(&self, key: &AttrKey<T>) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.entries
            .get(&key.id())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub(crate) fn get_or_insert_with<T>(&mut self, key: &AttrKey<T>, init: impl FnOnce() -> T) -> &mut T
    where
        T: Send + Sync + 'static,
    {
        self.entries
            .entry(key.id())
            .or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
            .expect("attribute key type is part of the map key")
    }

    pub(crate) fn insert<T>(&mut self, key: &AttrKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.entries.insert(key.id(), Box::new(value));
    }

    pub(crate) fn remove<T>(&mut self, key: &AttrKey<T>) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.entries
            .remove(&key.id())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNTER: AttrKey<u64> = AttrKey::new("counter");

    #[test]
    fn set_get_remove() {
        let mut map = AttrMap::default();
        assert!(map.get(&COUNTER).is_none());

        map.insert(&COUNTER, 7);
        assert_eq!(map.get(&COUNTER), Some(&7));

        assert_eq!(map.remove(&COUNTER), Some(7));
        assert!(map.get(&COUNTER).is_none());
    }

    #[test]
    fn same_name_different_type_do_not_collide() {
        static OTHER: AttrKey<String> = AttrKey::new("counter");

        let mut map = AttrMap::default();
        map.insert(&COUNTER, 1);
        map.insert(&OTHER, "one".to_string());

        assert_eq!(map.get(&COUNTER), Some(&1));
        assert_eq!(map.get(&OTHER).map(String::as_str), Some("one"));
    }

    #[test]
    fn get_or_insert_initializes_once() {
        let mut map = AttrMap::default();
        *map.get_or_insert_with(&COUNTER, || 10) += 1;
        *map.get_or_insert_with(&COUNTER, || 99) += 1;
        assert_eq!(map.get(&COUNTER), Some(&12));
    }
}
