use std::io;

use thiserror::Error;

/// A coroutine stack could not be reserved.
///
/// This is a recoverable condition: nothing has been inserted into the
/// manager's lists when it is returned, and the caller may retry later.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("stack of {requested} bytes does not fit in the address space")]
    SizeOverflow { requested: usize },
    #[error("failed to map {size} bytes for a coroutine stack")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to protect guard page at {addr:#x}")]
    Protect {
        addr: usize,
        #[source]
        source: io::Error,
    },
}
