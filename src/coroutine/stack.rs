use std::io;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use log::debug;

use crate::error::AllocationError;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Page granularity of the platform, in bytes.
pub fn page_size() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if value > 0 {
            value as usize
        } else {
            FALLBACK_PAGE_SIZE
        }
    })
}

/// A coroutine stack mapped with an inaccessible guard page on each side.
///
/// ```text
///  ----------------------------------
/// | guard | real stack space | guard |
///  ----------------------------------
/// ```
///
/// The whole mapping is owned by the `Stack` and released in one `munmap`
/// when it is dropped.
pub struct Stack {
    // start of the mapping, i.e. of the low guard page
    mapping: NonNull<u8>,
    // usable bytes, always a whole number of pages
    size: usize,
}

impl Stack {
    /// Maps a stack with at least `size` usable bytes.
    ///
    /// `size` is rounded up to whole pages, with a minimum of one page.
    pub fn new(size: usize) -> Result<Self, AllocationError> {
        let page = page_size();
        let usable = size
            .max(1)
            .checked_next_multiple_of(page)
            .ok_or(AllocationError::SizeOverflow { requested: size })?;
        let total = usable
            .checked_add(2 * page)
            .ok_or(AllocationError::SizeOverflow { requested: size })?;

        // SAFETY: anonymous private mapping, no file backing, the kernel
        // picks the (page aligned) address.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(AllocationError::Map {
                size: total,
                source: io::Error::last_os_error(),
            });
        }

        let low = addr.cast::<u8>();
        // SAFETY: both guard pages lie inside the `total` bytes just mapped.
        let high = unsafe { low.add(total - page) };
        for guard in [low, high] {
            if unsafe { libc::mprotect(guard.cast(), page, libc::PROT_NONE) } != 0 {
                let source = io::Error::last_os_error();
                // SAFETY: `addr`/`total` are exactly the mapping made above.
                unsafe { libc::munmap(addr, total) };
                return Err(AllocationError::Protect {
                    addr: guard as usize,
                    source,
                });
            }
        }

        debug!("mapped coroutine stack at {:p}, {} usable bytes", low, usable);
        Ok(Stack {
            // SAFETY: mmap never returns null on success.
            mapping: unsafe { NonNull::new_unchecked(low) },
            size: usable,
        })
    }

    /// Lowest usable address, just above the low guard page.
    pub fn base(&self) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(page_size()) }
    }

    /// One past the highest usable address. Stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base().add(self.size) }
    }

    /// Usable size in bytes, guard pages excluded.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size of the whole mapping, guard pages included.
    pub fn mapping_size(&self) -> usize {
        self.size + 2 * page_size()
    }

    pub fn bounds(&self) -> Range<usize> {
        self.base() as usize..self.top() as usize
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        debug!("unmapping coroutine stack at {:p}", self.mapping);
        // SAFETY: `mapping` and `mapping_size` describe a live mapping made
        // in `Stack::new`; nothing runs on it any more.
        unsafe {
            libc::munmap(self.mapping.as_ptr().cast(), self.mapping_size());
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("size", &self.size)
            .finish()
    }
}
