//! A small mark-sweep heap of garbage-collected objects.
//!
//! The runtime's root handles exist to keep values alive across
//! collections; this module provides the collector side of that
//! contract. The heap is deliberately simple. Objects never move, each
//! collection marks from a caller-supplied [`RootSource`] and sweeps
//! everything unmarked, and the whole heap runs stop-the-world on its
//! owning thread.

use {
    crate::{
        roots::{HandleAllocator, RootAcceptor},
        value::{TypeError, Value, ValueRepr, ValueType},
    },
    slog::{Discard, Logger, debug, o},
    std::{
        alloc::{Layout, handle_alloc_error},
        cell::Cell,
        fmt,
        mem::{align_of, size_of},
        ptr::NonNull,
    },
};

/// Set of roots scanned at the start of each collection.
///
/// The heap does not keep its own registry of root containers; whoever
/// drives a collection passes the roots in. The root handle allocator
/// implements this, so a runtime typically collects with
/// `heap.collect(&allocator)`.
pub trait RootSource
{
    /// Offer every root cell to the given acceptor.
    fn mark_roots(&self, acceptor: &mut dyn RootAcceptor);
}

impl RootSource for HandleAllocator
{
    fn mark_roots(&self, acceptor: &mut dyn RootAcceptor)
    {
        HandleAllocator::mark_roots(self, acceptor);
    }
}

/// Header at the start of each object allocation.
///
/// The object's field cells follow the header immediately.
#[repr(C)]
struct ObjectHeader
{
    /// The next object in the heap's list, if any.
    next: Cell<Option<NonNull<ObjectHeader>>>,

    /// Whether the object was reached during the current mark phase.
    ///
    /// Clear outside of collections.
    mark: Cell<bool>,

    /// The number of field cells following the header.
    field_count: u32,
}

const _: () = assert!(align_of::<Cell<Value>>() <= align_of::<ObjectHeader>());

/// Reference to an object owned by a heap.
///
/// This is the most basic kind of reference to an object. It provides
/// no liveness guarantees: the heap may collect the object as soon as
/// no root references it, so care must be taken when a reference is
/// used both before and after a collection. Root the object in a
/// handle to keep it live, and use that across collections instead.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ObjectRef
{
    inner: NonNull<ObjectHeader>,
}

impl ObjectRef
{
    /// The number of fields the object was created with.
    ///
    /// # Safety
    ///
    /// The object must be live.
    pub unsafe fn field_count(self) -> usize
    {
        self.inner.as_ref().field_count as usize
    }

    /// Pointer to the first field cell, just past the header.
    unsafe fn fields(self) -> *const Cell<Value>
    {
        self.inner.as_ptr().cast::<u8>()
            .add(size_of::<ObjectHeader>())
            .cast::<Cell<Value>>()
    }

    /// Read a field of the object.
    ///
    /// # Safety
    ///
    /// The object must be live, and `index` must be within its
    /// field count.
    pub unsafe fn field(self, index: usize) -> Value
    {
        debug_assert!(index < self.field_count());
        (*self.fields().add(index)).get()
    }

    /// Overwrite a field of the object.
    ///
    /// # Safety
    ///
    /// The object must be live, and `index` must be within its
    /// field count.
    pub unsafe fn set_field(self, index: usize, value: Value)
    {
        debug_assert!(index < self.field_count());
        (*self.fields().add(index)).set(value);
    }
}

impl ValueRepr for ObjectRef
{
    fn encode(self) -> Value
    {
        Value::object(self.inner.cast())
    }

    fn try_decode(value: Value) -> Result<Self, TypeError>
    {
        match value.value_type() {
            ValueType::Object =>
                Ok(Self{inner: value.as_object().cast()}),
            actual =>
                Err(TypeError{expected: ValueType::Object, actual}),
        }
    }
}

impl fmt::Debug for ObjectRef
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "ObjectRef({:?})", self.inner)
    }
}

/// Heap of garbage-collected objects.
///
/// The heap owns every object allocated from it, keeps them on an
/// intrusive list, and frees whatever a collection proves unreachable.
/// Objects are arrays of value cells; references between objects are
/// ordinary object-tagged values stored in those cells, and cycles are
/// collected like anything else.
pub struct Heap
{
    logger: Logger,

    /// Every object on the heap, most recently allocated first.
    objects: Cell<Option<NonNull<ObjectHeader>>>,

    /// The number of objects on the list.
    live: Cell<usize>,
}

impl Heap
{
    /// Create an empty heap that logs nowhere.
    pub fn new() -> Self
    {
        Self::with_logger(Logger::root(Discard, o!()))
    }

    /// Create an empty heap that logs collections to the given logger.
    pub fn with_logger(logger: Logger) -> Self
    {
        Self{
            logger,
            objects: Cell::new(None),
            live: Cell::new(0),
        }
    }

    /// The number of objects currently on the heap.
    pub fn live_objects(&self) -> usize
    {
        self.live.get()
    }

    /// Allocate an object with the given number of fields.
    ///
    /// Every field is initialized to undefined. The object is
    /// unreferenced at birth: root it, or store it in a reachable
    /// object, before the next collection.
    ///
    /// If the platform cannot satisfy the allocation, this calls
    /// [`handle_alloc_error`]; it does not return failure.
    pub fn alloc_object(&self, field_count: usize) -> ObjectRef
    {
        let layout = Self::object_layout(field_count);

        // The std::alloc API demands the layout again when freeing,
        // which the sweep does not know. malloc and free instead.
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { libc::malloc(layout.size()) };
        let Some(ptr) = NonNull::new(ptr)
            else { handle_alloc_error(layout) };

        let object = ptr.cast::<ObjectHeader>();
        let field_count = u32::try_from(field_count)
            .expect("Cannot allocate an object with this many fields");
        let header = ObjectHeader{
            next: Cell::new(self.objects.get()),
            mark: Cell::new(false),
            field_count,
        };
        // SAFETY: malloc returns memory aligned for any built-in type,
        //         and the layout reserves room for the header.
        unsafe { object.as_ptr().write(header); }

        let object = ObjectRef{inner: object};
        for index in 0..field_count as usize {
            // SAFETY: The layout reserves room for every field.
            unsafe {
                object.fields().add(index).cast_mut()
                    .write(Cell::new(Value::undefined()));
            }
        }

        self.objects.set(Some(object.inner));
        self.live.set(self.live.get() + 1);
        object
    }

    fn object_layout(field_count: usize) -> Layout
    {
        let size = size_of::<ObjectHeader>()
            .checked_add(field_count.checked_mul(size_of::<Cell<Value>>())
                .expect("Cannot allocate an object with this many fields"))
            .expect("Cannot allocate an object with this many fields");
        Layout::from_size_align(size, align_of::<ObjectHeader>())
            .expect("Cannot allocate an object with this many fields")
    }

    /// Collect garbage, returning the number of objects freed.
    ///
    /// Marks every object reachable from the given roots, directly or
    /// through the fields of other reachable objects, then frees the
    /// rest. The caller must not touch unrooted object references
    /// across this call.
    pub fn collect(&self, roots: &dyn RootSource) -> usize
    {
        // Mark.
        let mut marker = Marker{grey: Vec::new()};
        roots.mark_roots(&mut |cell: &Cell<Value>| marker.mark_value(cell.get()));
        while let Some(object) = marker.grey.pop() {
            let object = ObjectRef{inner: object};
            // SAFETY: Marked objects are still on the heap's list.
            for index in 0..unsafe { object.field_count() } {
                let value = unsafe { object.field(index) };
                marker.mark_value(value);
            }
        }

        // Sweep.
        let mut collected = 0;
        let mut prev: Option<NonNull<ObjectHeader>> = None;
        let mut cursor = self.objects.get();
        while let Some(object) = cursor {
            // SAFETY: Objects on the list are live until swept below.
            let header = unsafe { object.as_ref() };
            let next = header.next.get();
            if header.mark.get() {
                header.mark.set(false);
                prev = Some(object);
            } else {
                match prev {
                    // SAFETY: As above; prev is marked, hence retained.
                    Some(prev) => unsafe { prev.as_ref() }.next.set(next),
                    None => self.objects.set(next),
                }
                // SAFETY: The object came from malloc in alloc_object
                //         and nothing reachable refers to it anymore.
                unsafe { libc::free(object.as_ptr().cast()); }
                collected += 1;
            }
            cursor = next;
        }

        self.live.set(self.live.get() - collected);
        debug!(
            self.logger, "Finished collection";
            "collected" => collected,
            "live" => self.live.get(),
        );
        collected
    }
}

impl Default for Heap
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Drop for Heap
{
    fn drop(&mut self)
    {
        let mut cursor = self.objects.get();
        while let Some(object) = cursor {
            // SAFETY: Each object is freed exactly once, after
            //         reading its link.
            unsafe {
                cursor = object.as_ref().next.get();
                libc::free(object.as_ptr().cast());
            }
        }
    }
}

/// Mark-phase state: greys every object value it is shown.
struct Marker
{
    /// Objects marked but not yet traced.
    grey: Vec<NonNull<ObjectHeader>>,
}

impl Marker
{
    fn mark_value(&mut self, value: Value)
    {
        // Anything that is not an object carries no references,
        // including the native-pointer cells that encode free slots.
        if !value.is_object() {
            return;
        }
        let object = value.as_object().cast::<ObjectHeader>();
        // SAFETY: Object values reachable from live roots and live
        //         objects always reference live objects.
        let header = unsafe { object.as_ref() };
        if !header.mark.get() {
            header.mark.set(true);
            self.grey.push(object);
        }
    }
}
