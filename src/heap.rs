//                        Buddy Heap Allocator
// --------------------------------------------------------------------------
//
// Requests of 16 bytes up to half a page are rounded up to a power-of-two
// size class; each class keeps a free list under its own lock. When no
// class at or above the request holds a block, a whole page (an "arena")
// is taken from the page provider and its maximal block is split down to
// the requested class, parking the upper halves on their lists.
//
// Each arena opens with a magic sentinel, its membership link in the
// global arena list, and a slot map: one entry per 16 bytes of payload,
// holding the size of the block that starts there (0 = free or interior).
// Block size is therefore recoverable from an address alone, and a buddy's
// occupancy is a slot-range scan. On free, buddies coalesce upward; once
// the maximal block re-forms, the page goes back to the provider.

use core::array;
use core::fmt::{self, Write};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use spin::Mutex;
use static_assertions::const_assert;

#[cfg(test)]
use std::vec::Vec;

use crate::error::{Error, Result};
use crate::page::{PageFlags, PageProvider, PAGE_SIZE};

pub const MIN_BLOCK: usize = 16;
pub const MAX_BLOCK: usize = PAGE_SIZE / 2;

const MIN_SHIFT: u32 = MIN_BLOCK.ilog2();
pub const NUM_CLASSES: usize = (MAX_BLOCK.ilog2() - MIN_SHIFT + 1) as usize;
const SLOT_COUNT: usize = MAX_BLOCK / MIN_BLOCK;

/// Sentinel guarding every arena against stray frees and corruption.
const ARENA_MAGIC: u32 = 0x9a54_8eed;

/// Arena header. The payload (`MAX_BLOCK` bytes, one buddy tree) starts at
/// the next 16-byte boundary after it.
#[repr(C)]
struct Arena {
    magic: u32,
    link: LinkedListLink,
    slots: [u16; SLOT_COUNT],
}

const ARENA_HDR: usize = (size_of::<Arena>() + MIN_BLOCK - 1) & !(MIN_BLOCK - 1);

const_assert!(ARENA_HDR + MAX_BLOCK <= PAGE_SIZE);
const_assert!(MAX_BLOCK <= u16::MAX as usize);
const_assert!(size_of::<FreeBlock>() <= MIN_BLOCK);

impl Arena {
    unsafe fn init(page: NonNull<u8>) -> *mut Arena {
        let arena = page.as_ptr().cast::<Arena>();
        arena.write(Arena {
            magic: ARENA_MAGIC,
            link: LinkedListLink::new(),
            slots: [0; SLOT_COUNT],
        });
        arena
    }

    /// Arena containing `addr`; halts on a violated sentinel.
    unsafe fn from_block(addr: usize) -> *mut Arena {
        let arena = (addr & !(PAGE_SIZE - 1)) as *mut Arena;
        assert!(
            !arena.is_null() && (*arena).magic == ARENA_MAGIC,
            "heap corruption: no arena behind {addr:#x}"
        );
        arena
    }

    fn payload(arena: *mut Arena) -> usize {
        arena as usize + ARENA_HDR
    }

    /// Payload-relative offset of `addr`, validated against the arena's
    /// geometry.
    unsafe fn offset_of(arena: *mut Arena, addr: usize) -> usize {
        let off = addr.wrapping_sub(Self::payload(arena));
        assert!(
            off < MAX_BLOCK && off % MIN_BLOCK == 0,
            "heap corruption: {addr:#x} is not a block address"
        );
        off
    }

    unsafe fn slot(arena: *mut Arena, off: usize) -> u16 {
        ptr::addr_of!((*arena).slots[off >> MIN_SHIFT]).read()
    }

    unsafe fn set_slot(arena: *mut Arena, off: usize, size: u16) {
        ptr::addr_of_mut!((*arena).slots[off >> MIN_SHIFT]).write(size);
    }

    /// Whether any 16-byte slot in `[off, off + len)` backs a live block.
    unsafe fn range_in_use(arena: *mut Arena, off: usize, len: usize) -> bool {
        (off..off + len)
            .step_by(MIN_BLOCK)
            .any(|o| Self::slot(arena, o) != 0)
    }
}

intrusive_adapter!(ArenaAdapter<'a> = &'a Arena: Arena { link: LinkedListLink });

type ArenaList<'a> = LinkedList<ArenaAdapter<'a>>;

/// A free block stores its list link in its first bytes; a live block's
/// first byte belongs to the caller.
#[repr(C)]
struct FreeBlock {
    link: LinkedListLink,
}

impl FreeBlock {
    unsafe fn init(this: *mut Self) -> &'static FreeBlock {
        this.write(FreeBlock {
            link: LinkedListLink::new(),
        });
        &*this
    }
}

intrusive_adapter!(FreeBlockAdapter<'a> = &'a FreeBlock: FreeBlock { link: LinkedListLink });

type FreeList<'a> = LinkedList<FreeBlockAdapter<'a>>;

/// Per-size-class descriptor.
struct Desc {
    block_size: usize,
    free_list: Mutex<FreeList<'static>>,
}

impl Desc {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free_list: Mutex::new(FreeList::default()),
        }
    }
}

/// Class index for a request of `size` bytes.
fn class_of(size: usize) -> usize {
    let size = size.next_power_of_two().max(MIN_BLOCK);
    (size.ilog2() - MIN_SHIFT) as usize
}

/// The kernel heap: a descriptor table over buddy-split arenas.
///
/// `alloc` and `free` take one descriptor lock at a time and never two,
/// so lock order between classes is immaterial. The slot maps are
/// partitioned by arena and reached only through the owning class's lock.
pub struct Heap<P: PageProvider> {
    pages: P,
    descs: [Desc; NUM_CLASSES],
    arenas: Mutex<ArenaList<'static>>,
}

unsafe impl<P: PageProvider + Send> Send for Heap<P> {}
unsafe impl<P: PageProvider + Sync> Sync for Heap<P> {}

impl<P: PageProvider> Heap<P> {
    /// Builds the descriptor table: one class per power of two from
    /// `MIN_BLOCK` through `MAX_BLOCK`, plus the empty arena list.
    pub fn new(pages: P) -> Self {
        Self {
            pages,
            descs: array::from_fn(|i| Desc::new(MIN_BLOCK << i)),
            arenas: Mutex::new(ArenaList::default()),
        }
    }

    /// Returns a 16-byte-aligned block with at least `size` usable bytes.
    ///
    /// Requests of zero bytes or beyond `MAX_BLOCK` are invalid; the heap
    /// never spans a block across pages.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > MAX_BLOCK {
            return Err(Error::InvalidAllocSize(size));
        }
        let class = class_of(size);

        let (addr, mut level) = match self.take_free(class) {
            Some(found) => found,
            None => self.refill()?,
        };

        // Split down to the requested class, parking each upper half on
        // its own class's list.
        while level > class {
            level -= 1;
            let half = self.descs[level].block_size;
            unsafe {
                let upper = FreeBlock::init((addr + half) as *mut FreeBlock);
                self.descs[level].free_list.lock().push_back(upper);
            }
        }

        unsafe {
            let arena = Arena::from_block(addr);
            let off = Arena::offset_of(arena, addr);
            Arena::set_slot(arena, off, self.descs[class].block_size as u16);
            Ok(NonNull::new_unchecked(addr as *mut u8))
        }
    }

    /// Pops a block from the smallest class at or above `class` that has
    /// one.
    fn take_free(&self, class: usize) -> Option<(usize, usize)> {
        for level in class..NUM_CLASSES {
            let mut free_list = self.descs[level].free_list.lock();
            if let Some(block) = free_list.pop_front() {
                return Some((block as *const FreeBlock as usize, level));
            }
        }
        None
    }

    /// Backs the heap with a fresh arena and claims its maximal block.
    fn refill(&self) -> Result<(usize, usize)> {
        let page = self
            .pages
            .get_page(PageFlags::empty())
            .ok_or(Error::HeapExhausted)?;

        unsafe {
            let arena = Arena::init(page);
            self.arenas.lock().push_back(&*arena);
            log::debug!("heap: arena {:#x} backed", arena as usize);

            let mut free_list = self.descs[NUM_CLASSES - 1].free_list.lock();
            free_list.push_back(FreeBlock::init(Arena::payload(arena) as *mut FreeBlock));
            let block = free_list.pop_front().unwrap();
            Ok((block as *const FreeBlock as usize, NUM_CLASSES - 1))
        }
    }

    /// Releases a block, coalescing free buddies upward. An arena whose
    /// maximal block re-forms goes back to the page provider.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or the exact value of a prior successful
    /// `alloc`/`calloc`/`realloc` on this heap, not freed since.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        let addr = ptr.as_ptr() as usize;
        let arena = Arena::from_block(addr);
        let mut off = Arena::offset_of(arena, addr);

        let mut size = Arena::slot(arena, off) as usize;
        assert!(
            (MIN_BLOCK..=MAX_BLOCK).contains(&size) && size.is_power_of_two(),
            "heap corruption: free of untracked address {addr:#x}"
        );
        Arena::set_slot(arena, off, 0);

        // Poison the payload to flush out use-after-free early.
        #[cfg(debug_assertions)]
        ptr::write_bytes(ptr.as_ptr(), 0xcc, size);

        let mut level = class_of(size);
        loop {
            if size == MAX_BLOCK {
                // One free maximal block again: retire the whole arena.
                let mut arenas = self.arenas.lock();
                let mut cursor = arenas.cursor_mut_from_ptr(arena);
                cursor.remove().unwrap();
                drop(arenas);

                log::debug!("heap: arena {:#x} released", arena as usize);
                self.pages.free_page(NonNull::new_unchecked(arena as *mut u8));
                return;
            }

            let buddy_off = off ^ size;
            if Arena::range_in_use(arena, buddy_off, size) {
                let block = FreeBlock::init((Arena::payload(arena) + off) as *mut FreeBlock);
                self.descs[level].free_list.lock().push_back(block);
                return;
            }

            // Buddy is entirely free: claim it off its class list and keep
            // merging from the lower of the two addresses.
            let buddy = (Arena::payload(arena) + buddy_off) as *const FreeBlock;
            let mut free_list = self.descs[level].free_list.lock();
            assert!((*buddy).link.is_linked());
            let mut cursor = free_list.cursor_mut_from_ptr(buddy);
            cursor.remove().unwrap();
            drop(free_list);

            off = off.min(buddy_off);
            size <<= 1;
            level += 1;
        }
    }

    /// Resizes `old` to `new_size`, possibly moving the block.
    ///
    /// `old == None` is a plain allocation; `new_size == 0` frees and
    /// yields `Ok(None)`. On allocation failure the old block is intact.
    ///
    /// # Safety
    ///
    /// `old` must satisfy the contract of [`Heap::free`].
    pub unsafe fn realloc(
        &self,
        old: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        if new_size == 0 {
            self.free(old);
            return Ok(None);
        }

        let new = self.alloc(new_size)?;
        if let Some(old) = old {
            let old_size = self.block_size(old);
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), new_size.min(old_size));
            self.free(Some(old));
        }
        Ok(Some(new))
    }

    /// Allocates `n * m` bytes, zeroed. Multiplicative overflow fails the
    /// request.
    pub fn calloc(&self, n: usize, m: usize) -> Result<NonNull<u8>> {
        let size = n.saturating_mul(m);
        let block = self.alloc(size)?;
        unsafe { ptr::write_bytes(block.as_ptr(), 0, size) };
        Ok(block)
    }

    /// Bytes backing the live block at `ptr`, from the slot map.
    unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let arena = Arena::from_block(addr);
        Arena::slot(arena, Arena::offset_of(arena, addr)) as usize
    }

    /// Dumps the arena roster: total page count, then per page the free
    /// blocks of every class by ascending payload offset.
    pub fn print_memory(&self, out: &mut dyn Write) -> fmt::Result {
        let arenas = self.arenas.lock();
        writeln!(out, "No. of pages allocated : {}", arenas.iter().count())?;

        for (n, arena) in arenas.iter().enumerate() {
            writeln!(out, "Page {}:", n + 1)?;
            let base = arena as *const Arena as usize;
            for desc in &self.descs {
                write!(out, "Size {}:", desc.block_size)?;

                let mut offsets: heapless::Vec<u32, SLOT_COUNT> = heapless::Vec::new();
                let free_list = desc.free_list.lock();
                for block in free_list.iter() {
                    let addr = block as *const FreeBlock as usize;
                    if addr & !(PAGE_SIZE - 1) == base {
                        let _ = offsets.push((addr - base - ARENA_HDR) as u32);
                    }
                }
                drop(free_list);

                offsets.sort_unstable();
                for off in &offsets {
                    write!(out, " {off}")?;
                }
                writeln!(out)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    #[cfg(test)]
    /// `(block_size, free count)` per class, ascending.
    fn free_block_counts(&self) -> Vec<(usize, usize)> {
        self.descs
            .iter()
            .map(|d| (d.block_size, d.free_list.lock().iter().count()))
            .collect()
    }

    #[cfg(test)]
    fn arena_count(&self) -> usize {
        self.arenas.lock().iter().count()
    }
}
