//! Newtype wrappers around raw addresses, so tier/page/TLB code can't
//! accidentally mix virtual and physical values.

use std::fmt;

/// Page size assumed throughout the core; only base pages are migrated.
pub const PAGE_SIZE: u64 = 4096;

/// A virtual address, always base-page-aligned once it enters a [`PageRecord`](crate::page::PageRecord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VAddr(pub u64);

/// A physical address, always base-page-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PAddr(pub u64);

impl VAddr {
    pub fn page_base(self) -> VAddr {
        VAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl PAddr {
    pub const NULL: PAddr = PAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
