//! Paged guest memory with copy-on-write support.
//!
//! A [`Memory`] is a sparse table of 4 KiB pages. A template owns all of its
//! pages. A fork starts out empty and fills its table lazily through a
//! [`PageFaultHandler`]: reads map the parent's page as a shared
//! copy-on-write page, writes obtain a private page from the handler.

use crate::error::{MachineError, Result};
use crate::page::{PAGE_SIZE, Page, PageAttributes, PageData, PageInit, page_number, page_offset};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::Arc;

/// Space kept free below the top of memory for the guest stack. The mmap
/// region may not grow into it.
pub const STACK_RESERVE: u64 = 1 << 20;

static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Supplies pages to a memory that does not own them.
pub trait PageFaultHandler: Send + Sync {
    /// Returns a page that the faulting memory may write to. The page's data
    /// must not be shared with anyone else.
    fn page_fault(&mut self, pageno: u64, init: PageInit) -> Page;

    /// Returns an existing page to map for reading, if there is one. The
    /// returned page is normally copy-on-write.
    fn page_read_fault(&self, pageno: u64) -> Option<Page>;
}

/// A page-contiguous range of guest memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VBuffer {
    pub addr: u64,
    pub len: usize,
}

pub struct Memory {
    pages: HashMap<u64, Page>,
    memory_max: u64,
    handler: Option<Box<dyn PageFaultHandler>>,
    stack_initial: u64,
    mmap_address: u64,
    start_address: u64,
}

fn round_up_page(v: u64) -> Option<u64> {
    v.checked_add(PAGE_SIZE as u64 - 1)
        .map(|v| v & !(PAGE_SIZE as u64 - 1))
}

impl Memory {
    /// Creates an empty memory whose addresses must stay below `memory_max`.
    pub fn new(memory_max: u64) -> Memory {
        let memory_max = memory_max & !(PAGE_SIZE as u64 - 1);
        Memory {
            pages: HashMap::new(),
            memory_max,
            handler: None,
            stack_initial: memory_max,
            mmap_address: 0,
            start_address: 0,
        }
    }

    /// Creates an empty memory with the same layout as `parent`, whose pages
    /// are supplied by `handler`.
    pub fn fork(parent: &Memory, handler: Box<dyn PageFaultHandler>) -> Memory {
        Memory {
            pages: HashMap::new(),
            memory_max: parent.memory_max,
            handler: Some(handler),
            stack_initial: parent.stack_initial,
            mmap_address: parent.mmap_address,
            start_address: parent.start_address,
        }
    }

    pub fn memory_max(&self) -> u64 {
        self.memory_max
    }

    pub fn stack_initial(&self) -> u64 {
        self.stack_initial
    }

    pub fn set_stack_initial(&mut self, sp: u64) {
        self.stack_initial = sp;
    }

    pub fn mmap_address(&self) -> u64 {
        self.mmap_address
    }

    pub fn set_mmap_address(&mut self, addr: u64) {
        self.mmap_address = addr;
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn set_start_address(&mut self, addr: u64) {
        self.start_address = addr;
    }

    /// Whether this memory gets its pages from a fault handler.
    pub fn has_page_fault_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Number of pages currently installed in the page table.
    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// The installed page with number `pageno`, without faulting anything in.
    pub fn page(&self, pageno: u64) -> Option<&Page> {
        self.pages.get(&pageno)
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if addr < PAGE_SIZE as u64 {
            return Err(MachineError::ProtectionFault { addr });
        }
        match addr.checked_add(len) {
            Some(end) if end <= self.memory_max => Ok(()),
            _ => Err(MachineError::ProtectionFault { addr }),
        }
    }

    /// Looks up the page holding `addr` for reading, consulting the read
    /// fault handler if it is not installed yet. `None` means the page reads
    /// as zeroes.
    fn readable_page(&mut self, addr: u64) -> Result<Option<&Page>> {
        let pageno = page_number(addr);
        if !self.pages.contains_key(&pageno) {
            if let Some(page) = self.handler.as_ref().and_then(|h| h.page_read_fault(pageno)) {
                self.pages.insert(pageno, page);
            }
        }
        match self.pages.get(&pageno) {
            Some(page) if !page.attr.read => Err(MachineError::ProtectionFault { addr }),
            page => Ok(page),
        }
    }

    /// Looks up the page holding `addr` for writing, making it private to
    /// this memory first.
    fn writable_page(&mut self, addr: u64) -> Result<&mut PageData> {
        let pageno = page_number(addr);
        let page = match self.pages.entry(pageno) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                // A page the parent has committed is inherited before it is
                // copied below, so its contents survive the first write.
                let inherited = self.handler.as_ref().and_then(|h| h.page_read_fault(pageno));
                let page = match (inherited, self.handler.as_mut()) {
                    (Some(page), _) => page,
                    (None, Some(handler)) => handler.page_fault(pageno, PageInit::Initialized),
                    (None, None) => Page::new(PageAttributes::default(), PageData::zeroed()),
                };
                e.insert(page)
            }
        };
        if !page.attr.write {
            return Err(MachineError::ProtectionFault { addr });
        }
        if page.attr.is_cow {
            match self.handler.as_mut() {
                Some(handler) => {
                    let mut private = handler.page_fault(pageno, PageInit::Uninitialized);
                    private
                        .data_mut()
                        .as_bytes_mut()
                        .copy_from_slice(page.data().as_bytes());
                    private.attr.read = page.attr.read;
                    private.attr.write = page.attr.write;
                    private.attr.exec = page.attr.exec;
                    *page = private;
                }
                None => {
                    page.attr.is_cow = false;
                    page.attr.non_owning = false;
                }
            }
        }
        Ok(page.data_mut())
    }

    /// Fetches the instruction at `pc`.
    pub fn fetch(&mut self, pc: u64) -> Result<u32> {
        if pc & 3 != 0 {
            return Err(MachineError::MisalignedInstruction { pc });
        }
        let page = match self.readable_page(pc) {
            Ok(Some(page)) if page.attr.exec => page,
            _ => return Err(MachineError::ExecutionSpaceProtection { pc }),
        };
        let off = page_offset(pc);
        let bytes = &page.data().as_bytes()[off..off + 4];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len() as u64)?;
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            let dst = &mut buf[done..done + n];
            match self.readable_page(cur)? {
                Some(page) => dst.copy_from_slice(&page.data().as_bytes()[off..off + n]),
                None => dst.fill(0),
            }
            done += n;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len() as u64)?;
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done as u64;
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min(data.len() - done);
            self.writable_page(cur)?.as_bytes_mut()[off..off + n]
                .copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `addr` into a new vector.
    pub fn read_vec(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_range(addr, len as u64)?;
        let mut buf = vec![0; len];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self, addr: u64) -> Result<u8> {
        let mut b = [0; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self, addr: u64) -> Result<u16> {
        let mut b = [0; 2];
        self.read_bytes(addr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&mut self, addr: u64) -> Result<u32> {
        let mut b = [0; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self, addr: u64) -> Result<u64> {
        let mut b = [0; 8];
        self.read_bytes(addr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn write_u8(&mut self, addr: u64, v: u8) -> Result<()> {
        self.write_bytes(addr, &[v])
    }

    pub fn write_u16(&mut self, addr: u64, v: u16) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, v: u32) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, v: u64) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes())
    }

    /// Fills `len` bytes at `addr` with `value`.
    pub fn memset(&mut self, addr: u64, value: u8, len: u64) -> Result<()> {
        self.check_range(addr, len)?;
        let mut done = 0;
        while done < len {
            let cur = addr + done;
            let off = page_offset(cur);
            let n = ((PAGE_SIZE - off) as u64).min(len - done);
            self.writable_page(cur)?.as_bytes_mut()[off..off + n as usize].fill(value);
            done += n;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        self.check_range(dst, len)?;
        let data = self.read_vec(src, len as usize)?;
        self.write_bytes(dst, &data)
    }

    /// Length of the NUL-terminated string at `addr`, looking at no more than
    /// `max` bytes.
    pub fn strlen(&mut self, addr: u64, max: usize) -> Result<usize> {
        let mut len = 0;
        while len < max {
            let cur = addr + len as u64;
            self.check_range(cur, 1)?;
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min(max - len);
            let chunk = match self.readable_page(cur)? {
                Some(page) => &page.data().as_bytes()[off..off + n],
                None => return Ok(len),
            };
            if let Some(pos) = chunk.iter().position(|b| *b == 0) {
                return Ok(len + pos);
            }
            len += n;
        }
        Ok(max)
    }

    /// Reads the NUL-terminated string at `addr`, truncated to `max` bytes.
    pub fn memstring(&mut self, addr: u64, max: usize) -> Result<String> {
        let len = self.strlen(addr, max)?;
        let bytes = self.read_vec(addr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads bytes without faulting pages into the table. Used for
    /// diagnostics, which must not change the memory they inspect.
    pub fn peek_u64(&self, addr: u64) -> Option<u64> {
        if self.check_range(addr, 8).is_err() || page_offset(addr) > PAGE_SIZE - 8 {
            return None;
        }
        let pageno = page_number(addr);
        let off = page_offset(addr);
        let read = |page: &Page| {
            let mut b = [0; 8];
            b.copy_from_slice(&page.data().as_bytes()[off..off + 8]);
            u64::from_le_bytes(b)
        };
        match self.pages.get(&pageno) {
            Some(page) => Some(read(page)),
            None => self
                .handler
                .as_ref()
                .and_then(|h| h.page_read_fault(pageno))
                .map(|page| read(&page)),
        }
    }

    /// Splits `[addr, addr + len)` into page-contiguous buffers, appending
    /// them to `out` until it holds `limit` entries.
    ///
    /// Returns `false` if the range did not fit.
    pub fn gather_buffers_from_range(
        &mut self,
        out: &mut Vec<VBuffer>,
        limit: usize,
        addr: u64,
        len: u64,
    ) -> Result<bool> {
        self.check_range(addr, len)?;
        let mut done = 0;
        while done < len {
            if out.len() >= limit {
                return Ok(false);
            }
            let cur = addr + done;
            let n = ((PAGE_SIZE - page_offset(cur)) as u64).min(len - done);
            // Fault the page in now so that `view` can borrow it later.
            self.readable_page(cur)?;
            out.push(VBuffer {
                addr: cur,
                len: n as usize,
            });
            done += n;
        }
        Ok(true)
    }

    /// The bytes covered by a buffer produced by
    /// [`Memory::gather_buffers_from_range`].
    pub fn view(&self, buf: &VBuffer) -> &[u8] {
        let off = page_offset(buf.addr);
        let len = buf.len.min(PAGE_SIZE - off);
        match self.pages.get(&page_number(buf.addr)) {
            Some(page) => &page.data().as_bytes()[off..off + len],
            None => &ZERO_PAGE[off..off + len],
        }
    }

    /// Describes the page holding `addr`.
    pub fn page_info(&self, addr: u64) -> String {
        let pageno = page_number(addr);
        let mut s = format!("[{:#x}] ", pageno << crate::page::PAGE_SHIFT);
        match self.pages.get(&pageno) {
            Some(page) => {
                let _ = write!(s, "{}", page.attr);
            }
            None if self.handler.is_some() => s.push_str("not yet faulted in"),
            None => s.push_str("not mapped"),
        }
        s
    }

    /// Removes every loaned page from the table and returns its data.
    pub fn take_loaned_pages(&mut self) -> Vec<Arc<PageData>> {
        let (loaned, kept): (Vec<_>, Vec<_>) =
            self.pages.drain().partition(|(_, page)| page.is_loaned());
        self.pages.extend(kept);
        loaned.into_iter().map(|(_, page)| page.into_data()).collect()
    }

    /// Reserves `len` bytes from the mmap region, returning its address.
    pub fn mmap_allocate(&mut self, len: u64) -> Result<u64> {
        let addr = self.mmap_address;
        let limit = self.memory_max.saturating_sub(STACK_RESERVE);
        let end = round_up_page(len)
            .and_then(|len| addr.checked_add(len))
            .filter(|end| *end <= limit)
            .ok_or(MachineError::OutOfMemory { addr })?;
        self.mmap_address = end;
        Ok(addr)
    }

    /// Copies a loadable segment into owned pages.
    pub fn load_segment(
        &mut self,
        vaddr: u64,
        memsz: u64,
        data: &[u8],
        attr: PageAttributes,
    ) -> Result<()> {
        if memsz == 0 {
            return Ok(());
        }
        if (data.len() as u64) > memsz {
            return Err(MachineError::InvalidProgram(format!(
                "segment at {vaddr:#x} has more file data than memory"
            )));
        }
        if vaddr < PAGE_SIZE as u64 {
            return Err(MachineError::InvalidProgram(format!(
                "segment at {vaddr:#x} overlaps the zero page"
            )));
        }
        let end = match vaddr.checked_add(memsz) {
            Some(end) if end <= self.memory_max => end,
            _ => {
                return Err(MachineError::InvalidProgram(format!(
                    "segment at {vaddr:#x} extends past the end of memory"
                )));
            }
        };

        for pageno in page_number(vaddr)..=page_number(end - 1) {
            let page = self.segment_page(pageno);
            page.attr.read |= attr.read;
            page.attr.write |= attr.write;
            page.attr.exec |= attr.exec;
        }

        let mut done = 0;
        while done < data.len() {
            let cur = vaddr + done as u64;
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min(data.len() - done);
            self.segment_page(page_number(cur)).data_mut().as_bytes_mut()[off..off + n]
                .copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn segment_page(&mut self, pageno: u64) -> &mut Page {
        self.pages
            .entry(pageno)
            .or_insert_with(|| Page::new(PageAttributes::NONE, PageData::zeroed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const BASE: u64 = 0x10000;

    struct Parent(Arc<Mutex<Memory>>);

    impl PageFaultHandler for Parent {
        fn page_fault(&mut self, _pageno: u64, _init: PageInit) -> Page {
            Page::new(
                PageAttributes {
                    non_owning: true,
                    ..PageAttributes::default()
                },
                PageData::zeroed(),
            )
        }

        fn page_read_fault(&self, pageno: u64) -> Option<Page> {
            let parent = self.0.lock().unwrap();
            let page = parent.page(pageno)?;
            let mut attr = page.attr;
            attr.is_cow = true;
            attr.non_owning = true;
            Some(Page::new(attr, page.shared_data().clone()))
        }
    }

    fn parent() -> Arc<Mutex<Memory>> {
        let mut mem = Memory::new(1 << 24);
        mem.write_u64(BASE, 0x1122_3344_5566_7788).unwrap();
        Arc::new(Mutex::new(mem))
    }

    fn fork(parent: &Arc<Mutex<Memory>>) -> Memory {
        let p = parent.lock().unwrap();
        Memory::fork(&p, Box::new(Parent(parent.clone())))
    }

    #[test]
    fn zero_page_is_protected() {
        let mut mem = Memory::new(1 << 20);
        assert_eq!(
            mem.read_u8(8),
            Err(MachineError::ProtectionFault { addr: 8 })
        );
        assert!(mem.write_u8(0, 1).is_err());
        assert!(mem.read_u8(1 << 20).is_err());
    }

    #[test]
    fn unmapped_reads_are_zero() {
        let mut mem = Memory::new(1 << 20);
        assert_eq!(mem.read_u64(0x8000).unwrap(), 0);
        assert_eq!(mem.pages_active(), 0);
    }

    #[test]
    fn cross_page_access() {
        let mut mem = Memory::new(1 << 20);
        let addr = 0x2000 - 3;
        mem.write_u64(addr, u64::MAX).unwrap();
        assert_eq!(mem.read_u64(addr).unwrap(), u64::MAX);
        assert_eq!(mem.pages_active(), 2);
    }

    #[test]
    fn fork_reads_parent_and_copies_on_write() {
        let parent = parent();
        let mut a = fork(&parent);
        let mut b = fork(&parent);

        assert_eq!(a.read_u64(BASE).unwrap(), 0x1122_3344_5566_7788);
        a.write_u8(BASE, 0xff).unwrap();
        assert_eq!(a.read_u64(BASE).unwrap(), 0x1122_3344_5566_77ff);
        assert_eq!(b.read_u64(BASE).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(
            parent.lock().unwrap().read_u64(BASE).unwrap(),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn first_write_keeps_inherited_bytes() {
        let parent = parent();
        let mut a = fork(&parent);
        a.write_u8(BASE + 8, 1).unwrap();
        assert_eq!(a.read_u64(BASE).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(a.read_u8(BASE + 8).unwrap(), 1);
    }

    #[test]
    fn loaned_pages_are_returned() {
        let parent = parent();
        let mut a = fork(&parent);
        a.read_u8(BASE).unwrap();
        a.write_u8(BASE + 0x10000, 1).unwrap();
        a.write_u8(BASE, 1).unwrap();
        assert_eq!(a.take_loaned_pages().len(), 2);
        assert_eq!(a.pages_active(), 0);
    }

    #[test]
    fn write_protection() {
        let mut mem = Memory::new(1 << 20);
        let attr = PageAttributes {
            read: true,
            write: false,
            exec: true,
            ..PageAttributes::NONE
        };
        mem.load_segment(0x1000, 8, &[0x13, 0, 0, 0], attr).unwrap();
        assert_eq!(mem.fetch(0x1000).unwrap(), 0x13);
        assert!(mem.write_u8(0x1000, 0).is_err());
        assert_eq!(
            mem.fetch(0x1002),
            Err(MachineError::MisalignedInstruction { pc: 0x1002 })
        );
        assert_eq!(
            mem.fetch(0x3000),
            Err(MachineError::ExecutionSpaceProtection { pc: 0x3000 })
        );
    }

    #[test]
    fn gather_splits_on_page_boundaries() {
        let mut mem = Memory::new(1 << 20);
        mem.write_bytes(0x1ffe, b"abcd").unwrap();
        let mut out = Vec::new();
        assert!(mem.gather_buffers_from_range(&mut out, 8, 0x1ffe, 4).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(mem.view(&out[0]), b"ab");
        assert_eq!(mem.view(&out[1]), b"cd");

        out.clear();
        assert!(!mem.gather_buffers_from_range(&mut out, 1, 0x1ffe, 4).unwrap());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn strings() {
        let mut mem = Memory::new(1 << 20);
        mem.write_bytes(0x2ffc, b"hello\0").unwrap();
        assert_eq!(mem.strlen(0x2ffc, 100).unwrap(), 5);
        assert_eq!(mem.memstring(0x2ffc, 3).unwrap(), "hel");
    }

    #[test]
    fn mmap_leaves_room_for_the_stack() {
        let mut mem = Memory::new(4 << 20);
        mem.set_mmap_address(0x10000);
        assert_eq!(mem.mmap_allocate(100).unwrap(), 0x10000);
        assert_eq!(mem.mmap_address(), 0x11000);
        assert!(mem.mmap_allocate(3 << 20).is_err());
    }
}
