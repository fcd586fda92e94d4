use {
    crate::value::Value,
    std::{
        alloc::{Layout, alloc, dealloc, handle_alloc_error},
        cell::Cell,
        mem::{align_of, size_of},
        ptr::NonNull,
    },
};

/// Size in bytes of each chunk of slot storage.
///
/// Chunks are allocated aligned to this value. Using this guarantee,
/// the chunk that owns a slot is found by rounding the slot address
/// down to the nearest multiple of [`CHUNK_SIZE`], so handles need not
/// store anything besides their slot pointer.
pub const CHUNK_SIZE: usize = 1 << 10;

/// Byte offset of the slot array within a chunk.
const SLOTS_OFFSET: usize =
    next_multiple_of_power_of_two(size_of::<Chunk>(), align_of::<Slot>());

/// Number of slots in each chunk: whatever fits after the header.
pub const SLOTS_PER_CHUNK: usize = (CHUNK_SIZE - SLOTS_OFFSET) / size_of::<Slot>();

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(align_of::<Chunk>() <= CHUNK_SIZE);
const _: () = assert!(SLOTS_PER_CHUNK > 0);
const _: () = assert!(SLOTS_OFFSET + SLOTS_PER_CHUNK * size_of::<Slot>() <= CHUNK_SIZE);

/// Storage for one rooted value.
///
/// Slots live at stable addresses inside chunks and are only ever
/// referenced in place; they are never constructed, copied, or moved
/// by value. A slot is either live, in which case its cell holds the
/// rooted value, or free, in which case its cell holds a
/// native-pointer value linking it into its chunk's free list.
#[repr(transparent)]
pub (super) struct Slot
{
    value: Cell<Value>,
}

impl Slot
{
    /// The cell holding this slot's value.
    pub (super) fn cell(&self) -> &Cell<Value>
    {
        &self.value
    }
}

/// Header at the start of each chunk.
///
/// A chunk is a [`CHUNK_SIZE`]-byte, [`CHUNK_SIZE`]-aligned allocation
/// storing this header followed by [`SLOTS_PER_CHUNK`] slots. Slots
/// are handed out by bumping [`allocated_end`] until the chunk runs
/// out, and recycled through the free list thereafter. Slot storage at
/// indices past [`allocated_end`] is untouched memory and is never
/// read.
///
/// [`allocated_end`]: `Self::allocated_end`
#[repr(C)]
pub (super) struct Chunk
{
    /// The next chunk in the allocator's list, if any.
    next: Cell<Option<NonNull<Chunk>>>,

    /// The most recently freed slot in this chunk, if any.
    ///
    /// The rest of the free list is threaded through the slots
    /// themselves: each free slot's cell holds a native-pointer value
    /// addressing the slot that was freed before it, or null at the
    /// end of the list.
    free_list: Cell<Option<NonNull<Slot>>>,

    /// One past the highest slot index ever handed out.
    ///
    /// This high-water mark only grows. Only cells below it are
    /// presented to the garbage collector.
    allocated_end: Cell<u32>,
}

impl Chunk
{
    /// Allocate and initialize a fresh, empty chunk.
    ///
    /// If the platform cannot satisfy the aligned allocation,
    /// this calls [`handle_alloc_error`]; it does not return failure.
    pub (super) fn create() -> NonNull<Chunk>
    {
        let layout = Self::layout();

        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr)
            else { handle_alloc_error(layout) };

        let chunk = ptr.cast::<Chunk>();
        let header = Chunk{
            next: Cell::new(None),
            free_list: Cell::new(None),
            allocated_end: Cell::new(0),
        };
        // SAFETY: ptr points to fresh memory that is suitably aligned.
        unsafe { chunk.as_ptr().write(header); }

        chunk
    }

    /// Release a chunk's storage.
    ///
    /// # Safety
    ///
    /// The chunk must have come from [`create`][`Self::create`]
    /// and must not be used afterwards.
    pub (super) unsafe fn destroy(chunk: NonNull<Chunk>)
    {
        dealloc(chunk.as_ptr().cast(), Self::layout());
    }

    fn layout() -> Layout
    {
        Layout::from_size_align(CHUNK_SIZE, CHUNK_SIZE)
            .expect("Chunk layout must be valid")
    }

    /// The next chunk in the allocator's list.
    pub (super) fn next(&self) -> Option<NonNull<Chunk>>
    {
        self.next.get()
    }

    /// Replace the next chunk in the allocator's list.
    pub (super) fn set_next(&self, next: Option<NonNull<Chunk>>)
    {
        self.next.set(next);
    }

    /// One past the highest slot index ever handed out.
    pub (super) fn allocated_end(&self) -> usize
    {
        self.allocated_end.get() as usize
    }

    /// Pointer to the slot at the given index.
    fn slot_at(&self, index: usize) -> NonNull<Slot>
    {
        debug_assert!(index < SLOTS_PER_CHUNK);
        let base = self as *const Chunk as *mut u8;
        // SAFETY: The slot array is within the chunk's allocation.
        let slot = unsafe { base.add(SLOTS_OFFSET).cast::<Slot>().add(index) };
        // SAFETY: The allocation is non-null, so its interior is too.
        unsafe { NonNull::new_unchecked(slot) }
    }

    /// The cell of the slot at the given index.
    ///
    /// Must only be called for indices below
    /// [`allocated_end`][`Self::allocated_end`];
    /// storage past the high-water mark is untouched memory.
    pub (super) fn cell_at(&self, index: usize) -> &Cell<Value>
    {
        debug_assert!(index < self.allocated_end());
        // SAFETY: Slots below allocated_end are initialized,
        //         either with a rooted value or with a free-list link.
        unsafe { self.slot_at(index).as_ref() }.cell()
    }

    /// Attempt to allocate a slot from this chunk.
    ///
    /// Pops the free list if it is non-empty, and bumps the high-water
    /// mark otherwise. If the chunk is full, returns [`None`] and
    /// nothing changes. The returned slot's cell contents are
    /// unspecified; the caller must overwrite them before any read.
    pub (super) fn try_allocate(&self) -> Option<NonNull<Slot>>
    {
        if let Some(slot) = self.free_list.get() {
            // The popped slot's cell still encodes the next link.
            // SAFETY: Free slots are initialized with a free-list link.
            let next = unsafe { slot.as_ref() }.cell().get();
            let next = NonNull::new(next.as_native_pointer::<Slot>());
            debug_assert!(
                next.map_or(true, |n| self.contains(n)),
                "Corrupt free list",
            );
            self.free_list.set(next);
            return Some(slot);
        }

        let end = self.allocated_end.get();
        if (end as usize) < SLOTS_PER_CHUNK {
            self.allocated_end.set(end + 1);
            return Some(self.slot_at(end as usize));
        }

        None
    }

    /// Return a slot to this chunk.
    ///
    /// The slot's cell is overwritten with the link to the previous
    /// free-list head, and the slot becomes the new head. The slot
    /// must lie in this chunk and must currently be live.
    pub (super) fn free(&self, slot: NonNull<Slot>)
    {
        debug_assert!(self.contains(slot), "Slot is not owned by this chunk");
        let head = self.free_list.get()
            .map_or(std::ptr::null_mut(), NonNull::as_ptr);
        // SAFETY: The slot is live, so its cell is initialized.
        unsafe { slot.as_ref() }.cell().set(Value::native_pointer(head));
        self.free_list.set(Some(slot));
    }

    /// Whether the slot's address lies within this chunk's slot array.
    pub (super) fn contains(&self, slot: NonNull<Slot>) -> bool
    {
        let first = self.slot_at(0).as_ptr() as usize;
        let addr = slot.as_ptr() as usize;
        addr >= first && addr < first + SLOTS_PER_CHUNK * size_of::<Slot>()
    }
}

#[cfg(test)]
impl Chunk
{
    /// The number of slots on this chunk's free list.
    ///
    /// Asserts the structural free-list invariants as it walks:
    /// every link stays inside this chunk and the list is no longer
    /// than the allocated range, which also rules out cycles.
    pub (super) fn free_slot_count(&self) -> usize
    {
        let mut count = 0;
        let mut cursor = self.free_list.get();
        while let Some(slot) = cursor {
            assert!(self.contains(slot), "Free slot outside its chunk");
            count += 1;
            assert!(
                count <= self.allocated_end(),
                "Free list longer than the allocated range",
            );
            let next = unsafe { slot.as_ref() }.cell().get();
            cursor = NonNull::new(next.as_native_pointer::<Slot>());
        }
        count
    }
}

/// Compute the address of the chunk that owns `slot`.
pub (super) fn chunk_for_slot(slot: NonNull<Slot>) -> NonNull<Chunk>
{
    // Discard all the bits that vary within a chunk.
    // For example, 0b00010000 - 1 = 0b00001111.
    let mask = CHUNK_SIZE - 1;
    let addr = slot.as_ptr() as usize & !mask;
    // SAFETY: Masking bits off a non-null slot address cannot reach zero,
    //         because the slot array starts past the chunk header.
    let chunk = unsafe { NonNull::new_unchecked(addr as *mut Chunk) };
    debug_assert!(
        unsafe { chunk.as_ref() }.contains(slot),
        "Chunk does not contain the slot that found it",
    );
    chunk
}

/// Round up `lhs` to the next multiple of `rhs`, which must be a power of two.
const fn next_multiple_of_power_of_two(lhs: usize, rhs: usize) -> usize
{
    (lhs + rhs - 1) & !(rhs - 1)
}
