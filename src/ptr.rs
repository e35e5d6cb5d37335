//! The pointer and scoped-access facade (component F): a ref-counted
//! handle over a chunk plus RAII guards that pin it resident for the
//! lifetime of a borrow.
//!
//! Tracks element count/size so a `ManagedPtr<T>` can report its
//! length without a second lookup, and pins residency through a
//! scope-bound guard rather than a raw borrow.
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use crate::chunk::ChunkId;
use crate::error::RambrainError;
use crate::manager::Manager;

/// A handle to a chunk of `n_elem` values of type `T`, not itself
/// dereferenceable: call [`ManagedPtr::adhere`] or
/// [`ManagedPtr::adhere_mut`] to pin it resident and get a slice.
pub struct ManagedPtr<T> {
    manager: Arc<Manager>,
    chunk: ChunkId,
    n_elem: usize,
    _marker: PhantomData<T>,
}

impl<T> ManagedPtr<T> {
    pub(crate) fn new(manager: Arc<Manager>, chunk: ChunkId, n_elem: usize) -> Self {
        Self {
            manager,
            chunk,
            n_elem,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.n_elem
    }

    pub fn is_empty(&self) -> bool {
        self.n_elem == 0
    }

    pub fn byte_size(&self) -> usize {
        self.n_elem * mem::size_of::<T>()
    }

    /// Pins the chunk resident for read-only access for the life of
    /// the returned guard.
    pub fn adhere(&self) -> Result<AdhereTo<'_, T>, RambrainError> {
        self.manager.set_use(self.chunk, false)?;
        Ok(AdhereTo {
            ptr: self,
            _marker: PhantomData,
        })
    }

    /// Pins the chunk resident for read-write access, invalidating
    /// any cached swap copy up front.
    pub fn adhere_mut(&mut self) -> Result<AdhereToMut<'_, T>, RambrainError> {
        self.manager.set_use(self.chunk, true)?;
        Ok(AdhereToMut {
            ptr: self,
            _marker: PhantomData,
        })
    }
}

/// Cloning adds one external reference rather than copying bytes;
/// the chunk stays alive until every clone (and the original) has
/// been dropped.
impl<T> Clone for ManagedPtr<T> {
    fn clone(&self) -> Self {
        self.manager.reference(self.chunk);
        Self {
            manager: Arc::clone(&self.manager),
            chunk: self.chunk,
            n_elem: self.n_elem,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for ManagedPtr<T> {
    fn drop(&mut self) {
        self.manager.dereference(self.chunk);
    }
}

/// A read-only pin on a [`ManagedPtr`]'s bytes, reinterpreted as
/// `&[T]`. Releases the use count on drop.
pub struct AdhereTo<'a, T> {
    ptr: &'a ManagedPtr<T>,
    _marker: PhantomData<&'a [T]>,
}

impl<'a, T> AdhereTo<'a, T> {
    pub fn as_slice(&self) -> &[T] {
        let base = self
            .ptr
            .manager
            .loc_ptr(self.ptr.chunk)
            .expect("residency guaranteed by a live AdhereTo guard");
        unsafe { std::slice::from_raw_parts(base as *const T, self.ptr.n_elem) }
    }
}

impl<'a, T> Drop for AdhereTo<'a, T> {
    fn drop(&mut self) {
        self.ptr.manager.unset_use(self.ptr.chunk, 1);
    }
}

/// A read-write pin on a [`ManagedPtr`]'s bytes, reinterpreted as
/// `&mut [T]`. Releases the use count on drop.
pub struct AdhereToMut<'a, T> {
    ptr: &'a mut ManagedPtr<T>,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> AdhereToMut<'a, T> {
    pub fn as_slice(&self) -> &[T] {
        let base = self
            .ptr
            .manager
            .loc_ptr(self.ptr.chunk)
            .expect("residency guaranteed by a live AdhereToMut guard");
        unsafe { std::slice::from_raw_parts(base as *const T, self.ptr.n_elem) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let base = self
            .ptr
            .manager
            .loc_ptr(self.ptr.chunk)
            .expect("residency guaranteed by a live AdhereToMut guard");
        unsafe { std::slice::from_raw_parts_mut(base as *mut T, self.ptr.n_elem) }
    }
}

impl<'a, T> Drop for AdhereToMut<'a, T> {
    fn drop(&mut self) {
        self.ptr.manager.unset_use(self.ptr.chunk, 1);
    }
}

impl Manager {
    /// Allocates a chunk sized for `n_elem` values of `T` and wraps it
    /// in a [`ManagedPtr`].
    pub fn allocate_typed<T>(self: &Arc<Self>, n_elem: usize) -> Result<ManagedPtr<T>, RambrainError> {
        let bytes = n_elem * mem::size_of::<T>();
        let chunk = self.allocate(bytes)?;
        Ok(ManagedPtr::new(Arc::clone(self), chunk, n_elem))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ConfigBuilder;

    fn manager() -> Arc<Manager> {
        let config = ConfigBuilder::new(1 << 16, 1 << 20).build().unwrap();
        Manager::with_memory_swap(config)
    }

    #[test]
    fn write_then_read_through_guards() {
        let manager = manager();
        let mut ptr: ManagedPtr<u64> = manager.allocate_typed(16).unwrap();
        assert_eq!(ptr.len(), 16);

        {
            let mut guard = ptr.adhere_mut().unwrap();
            for (i, v) in guard.as_mut_slice().iter_mut().enumerate() {
                *v = i as u64;
            }
        }

        {
            let guard = ptr.adhere().unwrap();
            assert_eq!(guard.as_slice()[10], 10);
        }
    }

    #[test]
    fn dropping_ptr_frees_chunk() {
        let manager = manager();
        let ptr: ManagedPtr<u8> = manager.allocate_typed(128).unwrap();
        drop(ptr);
        // A fresh allocation should succeed without budget pressure
        // from the dropped chunk.
        let _ptr2: ManagedPtr<u8> = manager.allocate_typed(128).unwrap();
    }

    #[test]
    fn clone_keeps_chunk_alive_until_last_drop() {
        let manager = manager();
        let ptr: ManagedPtr<u8> = manager.allocate_typed(128).unwrap();
        let clone = ptr.clone();

        drop(ptr);
        // The clone still holds a reference, so the chunk must still
        // be usable even though the original was dropped.
        clone.adhere().unwrap();

        drop(clone);
        // Now both references are gone; a fresh allocation should
        // succeed without budget pressure from the freed chunk.
        let _ptr2: ManagedPtr<u8> = manager.allocate_typed(128).unwrap();
    }
}
