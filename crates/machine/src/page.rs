//! Guest memory pages and their attributes.

use std::fmt;
use std::sync::Arc;

/// Size in bytes of a single guest page.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`, used to turn addresses into page numbers.
pub const PAGE_SHIFT: u32 = 12;

/// Returns the page number containing `addr`.
#[inline]
pub const fn page_number(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// Returns the offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: u64) -> usize {
    (addr as usize) & (PAGE_SIZE - 1)
}

/// Backing storage for a single guest page.
///
/// Page data is always handled through an `Arc` so that a fork can map its
/// parent's page without copying it. Mutation goes through `Arc::make_mut`,
/// which means a buffer that is shared is never written in place.
#[derive(Clone)]
#[repr(C, align(8))]
pub struct PageData {
    buffer: [u8; PAGE_SIZE],
}

impl PageData {
    /// Allocates a new zero-filled page.
    pub fn zeroed() -> Arc<PageData> {
        Arc::new(PageData {
            buffer: [0; PAGE_SIZE],
        })
    }

    /// The page contents.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.buffer
    }

    /// The page contents, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.buffer
    }

    /// Overwrites the page with zeroes.
    pub fn fill_zero(&mut self) {
        self.buffer.fill(0);
    }

    /// Returns whether every byte of the page is zero.
    pub fn is_zero(&self) -> bool {
        self.buffer.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for PageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageData").finish_non_exhaustive()
    }
}

/// How a page handed out by a page-fault handler must be initialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PageInit {
    /// The page must read as all zeroes.
    Initialized,
    /// The page will be completely overwritten; its old contents may remain.
    Uninitialized,
}

/// Protection and ownership attributes of an installed page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    /// The data belongs to someone else and must be copied before the first
    /// write.
    pub is_cow: bool,
    /// The data was provided by a page-fault handler (either loaned or
    /// borrowed from a parent) rather than allocated by this memory.
    pub non_owning: bool,
}

impl Default for PageAttributes {
    fn default() -> Self {
        PageAttributes {
            read: true,
            write: true,
            exec: false,
            is_cow: false,
            non_owning: false,
        }
    }
}

impl PageAttributes {
    /// Attributes with no access rights at all.
    pub const NONE: PageAttributes = PageAttributes {
        read: false,
        write: false,
        exec: false,
        is_cow: false,
        non_owning: false,
    };
}

impl fmt::Display for PageAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.exec, 'x')
        )?;
        if self.is_cow {
            f.write_str(" cow")?;
        }
        if self.non_owning {
            f.write_str(" non-owning")?;
        }
        Ok(())
    }
}

/// A page installed in a guest page table.
#[derive(Clone, Debug)]
pub struct Page {
    pub attr: PageAttributes,
    data: Arc<PageData>,
}

impl Page {
    /// Creates a page from its attributes and backing data.
    pub fn new(attr: PageAttributes, data: Arc<PageData>) -> Page {
        Page { attr, data }
    }

    /// The page contents.
    pub fn data(&self) -> &PageData {
        &self.data
    }

    /// The shared handle to the page contents, used to map this page into
    /// another memory.
    pub fn shared_data(&self) -> &Arc<PageData> {
        &self.data
    }

    /// Consumes the page, returning its backing data.
    pub fn into_data(self) -> Arc<PageData> {
        self.data
    }

    /// Whether this page holds a buffer loaned out by a page-fault handler,
    /// which must be handed back when the memory goes away.
    pub fn is_loaned(&self) -> bool {
        self.attr.non_owning && !self.attr.is_cow
    }

    pub(crate) fn data_mut(&mut self) -> &mut PageData {
        Arc::make_mut(&mut self.data)
    }
}
