use {
    super::{
        HandleAllocator,
        chunk::{Slot, chunk_for_slot},
    },
    crate::value::{Value, ValueRepr},
    std::{cell::Cell, fmt, marker::PhantomData, ptr::NonNull},
};

/// Owning handle to a rooted value.
///
/// A handle owns one live slot in a [`HandleAllocator`] and keeps the
/// value in that slot visible to the garbage collector as a root for
/// as long as the handle exists. Handles can be moved freely, stored
/// in long-lived structures, and held across arbitrary suspensions;
/// the borrow of the allocator only ends when the handle is dropped,
/// at which point the slot returns to its chunk's free list.
///
/// Handles are move-only. Cloning a handle is not possible, because a
/// live slot is owned by exactly one handle; root the value a second
/// time instead with [`HandleAllocator::allocate`]. Assigning over a
/// handle drops the destination's previous slot first.
///
/// The `T` parameter is a typed view over the slot's cell, fixed at
/// allocation time. `Handle<Value>` (the default) is the untyped form.
pub struct Handle<'a, T: ValueRepr = Value>
{
    // INVARIANT: The slot is live and owned solely by this handle.
    slot: NonNull<Slot>,

    /// The slot must not outlive the allocator that issued it.
    allocator: PhantomData<&'a HandleAllocator>,

    /// Make sure handles are neither Send nor Sync.
    repr: PhantomData<*mut T>,
}

impl<'a, T: ValueRepr> Handle<'a, T>
{
    /// Wrap a freshly allocated slot.
    ///
    /// # Safety
    ///
    /// The slot must be live, owned by no other handle, and its cell
    /// must already hold a value of `T`'s representation.
    pub (super) unsafe fn from_slot(slot: NonNull<Slot>) -> Self
    {
        Self{slot, allocator: PhantomData, repr: PhantomData}
    }

    fn slot(&self) -> &Slot
    {
        // SAFETY: The slot is live for as long as the handle exists.
        unsafe { self.slot.as_ref() }
    }

    /// Decode the rooted value.
    pub fn get(&self) -> T
    {
        T::decode(self.slot().cell().get())
    }

    /// Overwrite the rooted value.
    pub fn set(&self, value: T)
    {
        self.slot().cell().set(value.encode());
    }

    /// The rooted value, untyped.
    pub fn value(&self) -> Value
    {
        self.slot().cell().get()
    }

    /// Borrow the slot's cell directly.
    ///
    /// The cell can be both read and written through the returned
    /// reference, and stays valid for the lifetime of the handle.
    /// Writes bypass the `T` facade; storing a value of a different
    /// representation makes later [`get`][`Self::get`] calls panic.
    pub fn raw_cell(&self) -> &Cell<Value>
    {
        self.slot().cell()
    }
}

impl<'a, T: ValueRepr> Drop for Handle<'a, T>
{
    fn drop(&mut self)
    {
        // The owning chunk is recovered from the slot address alone.
        let chunk = chunk_for_slot(self.slot);
        // SAFETY: Chunks stay alive until the allocator is dropped,
        //         which the phantom borrow postpones past this handle.
        unsafe { chunk.as_ref() }.free(self.slot);
    }
}

impl<'a, T: ValueRepr> fmt::Debug for Handle<'a, T>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Handle({:?})", self.value())
    }
}
