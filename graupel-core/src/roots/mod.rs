//! Root handles with dynamic lifetimes.
//!
//! Most native code roots garbage-collected values for the duration of
//! a stack frame. Some cannot: values stored in long-lived native
//! structures, or held across suspensions, need roots that live for as
//! long as the native code decides. The [`HandleAllocator`] serves
//! that case. It hands out [`Handle`]s, each owning one stable slot of
//! value storage, and presents every live slot to the garbage
//! collector during the mark phase.
//!
//! Slot storage is organized in chunks, aligned to their own
//! power-of-two size, so releasing a handle finds the owning chunk
//! with a single mask of the slot address. Within a chunk, slots are
//! handed out by bumping a high-water mark and recycled through a free
//! list threaded through the slots themselves, so a slot costs exactly
//! one value of memory.

pub use self::{
    chunk::{CHUNK_SIZE, SLOTS_PER_CHUNK},
    handle::Handle,
};

use {
    self::chunk::{Chunk, Slot},
    crate::value::{Value, ValueRepr},
    std::{cell::Cell, ptr::NonNull},
};

mod chunk;
mod handle;

/// Visitor invoked for every root cell during the mark phase.
///
/// The garbage collector implements this to scan and, for forwarding
/// collectors, rewrite root cells in place; the cells are offered
/// behind [`Cell`] references precisely so they can be updated.
///
/// Acceptors are offered every cell the allocator has ever handed out,
/// including the cells of slots that have since been freed. Freed
/// cells hold native-pointer values (free-list links) and must be
/// ignored, which collectors do anyway for any native-pointer cell.
pub trait RootAcceptor
{
    /// Offered each root cell in turn.
    fn accept(&mut self, cell: &Cell<Value>);
}

impl<F> RootAcceptor for F
    where F: FnMut(&Cell<Value>)
{
    fn accept(&mut self, cell: &Cell<Value>)
    {
        self(cell)
    }
}

/// Allocator for root handles with dynamic lifetimes.
///
/// The allocator owns a singly-linked list of chunks and grows lazily,
/// one chunk at a time, as handles are requested. Chunks are never
/// returned to the platform until the allocator is dropped, so slot
/// addresses are stable for the allocator's whole lifetime.
///
/// Allocation does not fail: if every chunk is full, a new chunk is
/// requested from the platform, and platform failure aborts the
/// process. Root slots are requested pervasively and unconditionally
/// by native code; a fallible signature would poison every such call
/// site for a case the runtime cannot survive anyway.
pub struct HandleAllocator
{
    /// The chunk most recently known to have a slot available, then
    /// the rest of the chunks in most-recently-promoted order.
    chunks: Cell<Option<NonNull<Chunk>>>,
}

impl HandleAllocator
{
    /// Create an allocator with no chunks.
    ///
    /// The first chunk is allocated on first use.
    pub fn new() -> Self
    {
        Self{chunks: Cell::new(None)}
    }

    /// Allocate a handle rooting the given value.
    pub fn allocate<T: ValueRepr>(&self, value: T) -> Handle<'_, T>
    {
        let slot = self.allocate_slot();
        // SAFETY: The slot is live; freshly allocated slots have
        //         unspecified contents, overwritten here before any read.
        unsafe {
            slot.as_ref().cell().set(value.encode());
            Handle::from_slot(slot)
        }
    }

    /// Allocate a slot, with unspecified cell contents.
    fn allocate_slot(&self) -> NonNull<Slot>
    {
        if let Some(head) = self.chunks.get() {
            // SAFETY: Chunks stay alive until the allocator is dropped.
            if let Some(slot) = unsafe { head.as_ref() }.try_allocate() {
                return slot;
            }
        }
        self.allocate_slot_slow()
    }

    /// Find a chunk with a slot available, or grow by one chunk.
    ///
    /// The chunk that yields a slot is spliced to the head of the
    /// list, so the next allocation finds it on the fast path. One
    /// miss pays the list walk; steady-state churn then stays on the
    /// head chunk.
    #[cold]
    #[inline(never)]
    fn allocate_slot_slow(&self) -> NonNull<Slot>
    {
        let mut prev: Option<NonNull<Chunk>> = None;
        let mut cursor = self.chunks.get();
        while let Some(chunk) = cursor {
            // SAFETY: Chunks stay alive until the allocator is dropped.
            let chunk_ref = unsafe { chunk.as_ref() };
            if let Some(slot) = chunk_ref.try_allocate() {
                if let Some(prev) = prev {
                    // SAFETY: As above.
                    unsafe { prev.as_ref() }.set_next(chunk_ref.next());
                    chunk_ref.set_next(self.chunks.get());
                    self.chunks.set(Some(chunk));
                }
                return slot;
            }
            prev = cursor;
            cursor = chunk_ref.next();
        }

        // Every chunk (perhaps zero) is full. Link in a fresh one.
        let chunk = Chunk::create();
        // SAFETY: A fresh chunk is alive and not yet shared.
        let chunk_ref = unsafe { chunk.as_ref() };
        chunk_ref.set_next(self.chunks.get());
        self.chunks.set(Some(chunk));

        chunk_ref.try_allocate()
            .expect("A fresh chunk must have a slot available")
    }

    /// Offer every root cell to the given acceptor.
    ///
    /// Cells are offered chunk by chunk, covering each chunk's
    /// allocated range in slot order. The garbage collector calls this
    /// during its mark phase, with the mutator paused; it must not be
    /// interleaved with allocation or handle drops.
    pub fn mark_roots<A: RootAcceptor + ?Sized>(&self, acceptor: &mut A)
    {
        let mut cursor = self.chunks.get();
        while let Some(chunk) = cursor {
            // SAFETY: Chunks stay alive until the allocator is dropped.
            let chunk = unsafe { chunk.as_ref() };
            for index in 0..chunk.allocated_end() {
                acceptor.accept(chunk.cell_at(index));
            }
            cursor = chunk.next();
        }
    }
}

impl Default for HandleAllocator
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Drop for HandleAllocator
{
    fn drop(&mut self)
    {
        // Handles borrow the allocator, so none outlive this point.
        let mut cursor = self.chunks.get();
        while let Some(chunk) = cursor {
            // SAFETY: Each chunk is destroyed exactly once, after
            //         reading its link.
            unsafe {
                cursor = chunk.as_ref().next();
                Chunk::destroy(chunk);
            }
        }
    }
}

#[cfg(test)]
impl HandleAllocator
{
    /// The number of live slots, counted the hard way.
    ///
    /// Walks every chunk and subtracts its free-list length from its
    /// allocated range, asserting the free-list invariants on the way.
    pub (crate) fn live_slot_count(&self) -> usize
    {
        let mut total = 0;
        let mut cursor = self.chunks.get();
        while let Some(chunk) = cursor {
            let chunk = unsafe { chunk.as_ref() };
            total += chunk.allocated_end() - chunk.free_slot_count();
            cursor = chunk.next();
        }
        total
    }

    /// The addresses of all chunks, in list order.
    pub (crate) fn chunk_addresses(&self) -> Vec<usize>
    {
        let mut addresses = Vec::new();
        let mut cursor = self.chunks.get();
        while let Some(chunk) = cursor {
            addresses.push(chunk.as_ptr() as usize);
            cursor = unsafe { chunk.as_ref() }.next();
        }
        addresses
    }

    /// The number of chunks in the list.
    pub (crate) fn chunk_count(&self) -> usize
    {
        self.chunk_addresses().len()
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        proptest::{self as p, proptest},
    };

    fn cell_address<T: ValueRepr>(handle: &Handle<T>) -> usize
    {
        handle.raw_cell() as *const Cell<Value> as usize
    }

    #[test]
    fn allocator_starts_with_no_chunks()
    {
        let allocator = HandleAllocator::new();
        assert_eq!(allocator.chunk_count(), 0);
        assert_eq!(allocator.live_slot_count(), 0);
    }

    #[test]
    fn a_full_chunks_worth_fits_in_one_chunk()
    {
        let allocator = HandleAllocator::new();
        let handles: Vec<Handle<f64>> =
            (0..SLOTS_PER_CHUNK).map(|i| allocator.allocate(i as f64)).collect();

        assert_eq!(allocator.chunk_count(), 1);
        assert_eq!(allocator.live_slot_count(), SLOTS_PER_CHUNK);

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.get(), i as f64);
        }
    }

    #[test]
    fn overflowing_a_chunk_links_a_new_chunk_at_the_head()
    {
        let allocator = HandleAllocator::new();
        let _handles: Vec<Handle<f64>> =
            (0..SLOTS_PER_CHUNK).map(|i| allocator.allocate(i as f64)).collect();
        let first = allocator.chunk_addresses();

        let _extra = allocator.allocate(Value::undefined());
        let grown = allocator.chunk_addresses();

        assert_eq!(grown.len(), 2);
        assert_eq!(grown[1], first[0]);
        assert_ne!(grown[0], first[0]);
        assert_eq!(allocator.live_slot_count(), SLOTS_PER_CHUNK + 1);
    }

    #[test]
    fn freed_slots_are_reused_without_growing()
    {
        let allocator = HandleAllocator::new();
        let handles: Vec<Handle<bool>> =
            (0..SLOTS_PER_CHUNK).map(|i| allocator.allocate(i % 2 == 0)).collect();
        assert_eq!(allocator.chunk_count(), 1);

        drop(handles);
        assert_eq!(allocator.live_slot_count(), 0);

        let _handle = allocator.allocate(true);
        assert_eq!(allocator.chunk_count(), 1);
        assert_eq!(allocator.live_slot_count(), 1);
    }

    #[test]
    fn handles_read_back_what_was_stored()
    {
        let allocator = HandleAllocator::new();

        let handle = allocator.allocate(false);
        assert!(!handle.get());
        handle.set(true);
        assert!(handle.get());

        let untyped = allocator.allocate(Value::undefined());
        assert!(untyped.get().is_undefined());
        untyped.set(Value::null());
        assert!(untyped.value().is_null());
    }

    #[test]
    fn freed_slots_are_reused_in_lifo_order()
    {
        let allocator = HandleAllocator::new();
        let a = allocator.allocate(Value::number(1.0));
        let b = allocator.allocate(Value::number(2.0));
        let c = allocator.allocate(Value::number(3.0));
        let addresses = [cell_address(&a), cell_address(&b), cell_address(&c)];

        drop(a);
        drop(b);
        drop(c);

        let x = allocator.allocate(Value::number(4.0));
        let y = allocator.allocate(Value::number(5.0));
        let z = allocator.allocate(Value::number(6.0));

        assert_eq!(cell_address(&x), addresses[2]);
        assert_eq!(cell_address(&y), addresses[1]);
        assert_eq!(cell_address(&z), addresses[0]);
    }

    #[test]
    fn allocation_promotes_the_chunk_that_served_it()
    {
        let allocator = HandleAllocator::new();
        let mut handles: Vec<Option<Handle<f64>>> =
            (0..3 * SLOTS_PER_CHUNK)
            .map(|i| Some(allocator.allocate(i as f64)))
            .collect();

        let order = allocator.chunk_addresses();
        assert_eq!(order.len(), 3);

        // The tenth handle lives in the first chunk ever allocated,
        // which sits at the tail of the list by now.
        let tail = *order.last().unwrap();
        let slot = cell_address(handles[9].as_ref().unwrap());
        assert_eq!(slot & !(CHUNK_SIZE - 1), tail);

        handles[9] = None;
        let fresh = allocator.allocate(0.0);

        // The freed slot is the one handed back, and its chunk moved
        // to the head of the list.
        assert_eq!(cell_address(&fresh), slot);
        assert_eq!(
            allocator.chunk_addresses(),
            vec![tail, order[0], order[1]],
        );
    }

    #[test]
    fn slot_addresses_stay_inside_their_aligned_chunks()
    {
        let allocator = HandleAllocator::new();
        let handles: Vec<Handle<f64>> =
            (0..5 * SLOTS_PER_CHUNK).map(|i| allocator.allocate(i as f64)).collect();
        let chunks = allocator.chunk_addresses();

        for handle in &handles {
            let address = cell_address(handle);
            let offset = address & (CHUNK_SIZE - 1);
            assert!(offset >= std::mem::size_of::<Chunk>());
            assert!(offset < CHUNK_SIZE);
            assert!(chunks.contains(&(address & !(CHUNK_SIZE - 1))));
        }
    }

    #[test]
    fn bulk_allocation_with_churn_reuses_chunks()
    {
        const BULK: usize = 1 << 17;

        let allocator = HandleAllocator::new();
        let mut handles: Vec<Handle<bool>> =
            (0..BULK).map(|i| allocator.allocate(i % 2 == 1)).collect();
        assert_eq!(allocator.live_slot_count(), BULK);

        let mut sense = false;
        for handle in &handles {
            assert_eq!(handle.get(), sense);
            sense = !sense;
        }

        // Free every other handle, then refill; the free lists must
        // absorb the refill without another chunk being mapped.
        let chunks_at_peak = allocator.chunk_count();
        let mut index = 0;
        handles.retain(|_| {
            let keep = index % 2 == 1;
            index += 1;
            keep
        });
        assert_eq!(allocator.live_slot_count(), BULK / 2);

        for i in 0..BULK / 2 {
            handles.push(allocator.allocate(i % 2 == 1));
        }
        assert_eq!(allocator.live_slot_count(), BULK);
        assert_eq!(allocator.chunk_count(), chunks_at_peak);

        handles.clear();
        assert_eq!(allocator.live_slot_count(), 0);
    }

    #[test]
    fn mark_roots_offers_every_cell_and_is_repeatable()
    {
        let allocator = HandleAllocator::new();
        let mut handles: Vec<Option<Handle<f64>>> =
            (0..10).map(|i| Some(allocator.allocate(i as f64))).collect();
        for index in [1, 4, 7] {
            handles[index] = None;
        }

        let record = || {
            let mut cells = Vec::new();
            allocator.mark_roots(&mut |cell: &Cell<Value>| {
                cells.push((cell as *const Cell<Value> as usize, cell.get()));
            });
            cells
        };

        let first = record();
        let second = record();
        assert_eq!(first, second);

        // Every cell ever handed out is offered, and the freed ones
        // show up as ignorable native-pointer links.
        assert_eq!(first.len(), 10);
        let links = first.iter().filter(|(_, v)| v.is_native_pointer()).count();
        assert_eq!(links, 3);
    }

    #[test]
    fn acceptors_can_rewrite_cells_in_place()
    {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(1.5);

        allocator.mark_roots(&mut |cell: &Cell<Value>| {
            // A forwarding collector updates roots exactly like this.
            if cell.get().is_number() {
                cell.set(Value::number(cell.get().as_number() + 1.0));
            }
        });

        assert_eq!(handle.get(), 2.5);
    }

    #[test]
    fn random_churn_keeps_the_books_balanced()
    {
        const STEPS: usize = 1_000_000;

        let allocator = HandleAllocator::new();
        let mut handles: Vec<Handle<f64>> = Vec::new();
        let mut state: u64 = 0x853C_49E6_748F_EA9B;

        for step in 0..STEPS {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let roll = (state >> 33) as usize;

            if handles.is_empty() || roll & 1 == 0 {
                handles.push(allocator.allocate(step as f64));
            } else {
                handles.swap_remove((roll >> 1) % handles.len());
            }

            if step % (1 << 16) == 0 {
                // live_slot_count also asserts every free-list bound.
                assert_eq!(allocator.live_slot_count(), handles.len());
            }
        }

        assert_eq!(allocator.live_slot_count(), handles.len());
        handles.clear();
        assert_eq!(allocator.live_slot_count(), 0);
    }

    proptest!
    {
        #[test]
        fn any_interleaving_keeps_the_books_balanced(
            ops in p::collection::vec(p::num::u16::ANY, 0..512),
        )
        {
            let allocator = HandleAllocator::new();
            let mut handles: Vec<Handle<f64>> = Vec::new();

            for op in ops {
                if handles.is_empty() || op & 1 == 0 {
                    handles.push(allocator.allocate(op as f64));
                } else {
                    handles.swap_remove((op >> 1) as usize % handles.len());
                }
            }

            assert_eq!(allocator.live_slot_count(), handles.len());
            handles.clear();
            assert_eq!(allocator.live_slot_count(), 0);
        }
    }
}
