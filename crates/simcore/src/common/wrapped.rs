use std::cell::{Ref, RefCell, RefMut};
use std::clone::Clone;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::{Rc, Weak};

/// Wrapper struct containing a `Rc<RefCell<T>>`.
///
/// `PartialEq`, `Eq` and `Hash` are implemented on the *pointer value*, so two wrappers
/// are equal only when they point to the same object.
#[derive(Default, Debug)]
pub struct WrappedRcRefCell<T: ?Sized> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    /// Create a new wrapped instance. This is not called `new` so that you may implement
    /// your own function `new`.
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedRcRefCell {
            inner: Rc::new(RefCell::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedRcRefCell<T> {
    /// Return a immutable reference to contents. Panics whenever `RefCell::borrow()` would.
    #[inline]
    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.deref().borrow()
    }

    /// Return a mutable reference to contents. Panics whenever `RefCell::borrow_mut()` would.
    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.deref().borrow_mut()
    }

    /// Like [`get`](Self::get), but returns `None` while the value is mutably borrowed.
    #[inline]
    pub fn try_get(&self) -> Option<Ref<'_, T>> {
        self.inner.deref().try_borrow().ok()
    }

    #[inline]
    pub fn downgrade(&self) -> WeakRcRefCell<T> {
        WeakRcRefCell {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl<T: ?Sized> Clone for WrappedRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedRcRefCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Hash for WrappedRcRefCell<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        let ptr = &*self.inner as *const RefCell<T>;
        ptr.hash(state);
    }
}

impl<T: ?Sized> PartialEq for WrappedRcRefCell<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Eq for WrappedRcRefCell<T> {}

/// Non-owning counterpart of [`WrappedRcRefCell`].
pub struct WeakRcRefCell<T: ?Sized> {
    inner: Weak<RefCell<T>>,
}

impl<T: ?Sized> WeakRcRefCell<T> {
    #[inline]
    pub fn upgrade(&self) -> Option<WrappedRcRefCell<T>> {
        self.inner.upgrade().map(|inner| WrappedRcRefCell { inner })
    }
}

impl<T: ?Sized> Clone for WeakRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        WeakRcRefCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for WeakRcRefCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}
