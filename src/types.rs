use std::fmt;

/// Size of one page in bytes. The store does not support other page sizes.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a page in the backing file. Dense, monotonically assigned
/// by the buffer manager; page 0 is reserved for store metadata.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

impl PageId {
    /// Byte offset of this page in the backing file.
    pub fn file_offset(self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of pages, as tracked on transaction commit lists.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LargePage {
    pub start_pid: PageId,
    pub page_cnt: u32,
}

impl LargePage {
    pub fn new(start_pid: PageId, page_cnt: u32) -> Self {
        Self {
            start_pid,
            page_cnt,
        }
    }

    /// First page past the end of the run.
    pub fn end_pid(&self) -> PageId {
        PageId(self.start_pid.0 + self.page_cnt as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_file_offset() {
        assert_eq!(PageId(0).file_offset(), 0);
        assert_eq!(PageId(3).file_offset(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn large_page_end() {
        let lp = LargePage::new(PageId(4), 4);
        assert_eq!(lp.end_pid(), PageId(8));
    }
}
