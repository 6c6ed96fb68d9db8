//! # Relocation Program
//!
//! The relocation routine runs with the MMU off and no stack. Everything it
//! needs is encoded in a list of 64-bit words, each a page address with one
//! flag in its low bits:
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `DESTINATION` | subsequent source pages are copied starting here |
//! | `INDIRECTION` | the list continues at the start of this page |
//! | `DONE` | stop and jump to the new kernel |
//! | `SOURCE` | copy one page from here to the destination, then advance it |
//!
//! The head word is either an `INDIRECTION` to the first list page, or a lone
//! `DONE` for images that are already in place.

use crate::KexecError;
use crate::OutOfMemory;
use crate::config::DumpVerbosity;
use crate::platform::{CacheMaintenance, PageAllocator, PhysicalMemory};
use crate::segment::Segment;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_info::boot::{IND_DESTINATION, IND_DONE, IND_FLAGS, IND_INDIRECTION, IND_SOURCE};
use kernel_info::memory::{ENTRIES_PER_PAGE, PAGE_SIZE};
use kernel_memory_addresses::{PageFrameNumber, PhysicalPage, PhysicalRange, Size4K};
use log::debug;

const PAGE: usize = PAGE_SIZE as usize;

/// Raw relocation list word.
///
/// Layout (LSB→MSB):
/// - bits 0..3: destination, indirection, done, source
/// - bits 4..11: reserved (must be zero)
/// - bits 12..63: page frame number
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EntryWord {
    pub destination: bool,
    pub indirection: bool,
    pub done: bool,
    pub source: bool,
    #[bits(8)]
    __: u8,
    #[bits(52)]
    pub pfn: u64,
}

const _: () = {
    assert!(EntryWord::new().with_destination(true).into_bits() == IND_DESTINATION);
    assert!(EntryWord::new().with_indirection(true).into_bits() == IND_INDIRECTION);
    assert!(EntryWord::new().with_done(true).into_bits() == IND_DONE);
    assert!(EntryWord::new().with_source(true).into_bits() == IND_SOURCE);
};

/// A decoded relocation list word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Entry {
    Destination(PhysicalPage<Size4K>),
    Indirection(PhysicalPage<Size4K>),
    Done,
    Source(PhysicalPage<Size4K>),
}

impl Entry {
    #[must_use]
    pub const fn into_word(self) -> u64 {
        let w = EntryWord::new();
        match self {
            Self::Destination(p) => w.with_destination(true).with_pfn(p.pfn().as_u64()),
            Self::Indirection(p) => w.with_indirection(true).with_pfn(p.pfn().as_u64()),
            Self::Done => w.with_done(true),
            Self::Source(p) => w.with_source(true).with_pfn(p.pfn().as_u64()),
        }
        .into_bits()
    }

    /// Decode a list word. Exactly one flag must be set.
    ///
    /// # Errors
    /// [`KexecError::UnterminatedList`] for a zero word and
    /// [`KexecError::CorruptEntry`] for any other malformed word.
    pub const fn from_word(word: u64) -> Result<Self, KexecError> {
        if word == 0 {
            return Err(KexecError::UnterminatedList);
        }
        if word & (PAGE_SIZE - 1) & !IND_FLAGS != 0 {
            return Err(KexecError::CorruptEntry(word));
        }
        let page = PageFrameNumber::new(EntryWord::from_bits(word).pfn()).page();
        match word & IND_FLAGS {
            IND_DESTINATION => Ok(Self::Destination(page)),
            IND_INDIRECTION => Ok(Self::Indirection(page)),
            IND_DONE => Ok(Self::Done),
            IND_SOURCE => Ok(Self::Source(page)),
            _ => Err(KexecError::CorruptEntry(word)),
        }
    }
}

/// One step of a list traversal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalkStep {
    /// The list continues in this page. The head yields one as well.
    Indirection(PhysicalPage<Size4K>),
    Destination(PhysicalPage<Size4K>),
    /// Copy `source` to `destination`.
    Source {
        source: PhysicalPage<Size4K>,
        destination: PhysicalPage<Size4K>,
    },
    Done,
}

/// Random access to the words of list pages.
pub trait ListSource {
    /// Word `slot` of the list page at `page`.
    ///
    /// # Errors
    /// [`KexecError::PhysicalAccess`] if the page cannot be read.
    fn list_word(&self, page: PhysicalPage<Size4K>, slot: usize) -> Result<u64, KexecError>;
}

/// A list that has been written to physical memory.
pub struct CommittedList<'m, M: ?Sized> {
    mem: &'m M,
}

impl<'m, M: PhysicalMemory + ?Sized> CommittedList<'m, M> {
    pub const fn new(mem: &'m M) -> Self {
        Self { mem }
    }
}

impl<M: PhysicalMemory + ?Sized> ListSource for CommittedList<'_, M> {
    fn list_word(&self, page: PhysicalPage<Size4K>, slot: usize) -> Result<u64, KexecError> {
        let mut word = [0u8; 8];
        self.mem.read(page.base() + (slot as u64) * 8, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Position {
    Head(u64),
    Slot(PhysicalPage<Size4K>, usize),
    Finished,
}

/// Incremental traversal of a relocation list.
///
/// The cursor holds no borrow of the list between steps, so a caller can
/// interleave reads of the list with writes to the memory it lives in.
#[derive(Debug, Clone)]
pub struct ListCursor {
    position: Position,
    destination: Option<PhysicalPage<Size4K>>,
}

impl ListCursor {
    #[must_use]
    pub const fn new(head: u64) -> Self {
        Self {
            position: Position::Head(head),
            destination: None,
        }
    }

    /// Advance by one entry. Returns `None` once `Done` has been yielded.
    ///
    /// # Errors
    /// - [`KexecError::CorruptEntry`] for a malformed word or a head that is
    ///   neither an indirection nor done.
    /// - [`KexecError::UnterminatedList`] if a page runs out without an
    ///   indirection or done.
    /// - [`KexecError::SourceWithoutDestination`] for a source before any
    ///   destination.
    pub fn next<L: ListSource + ?Sized>(
        &mut self,
        list: &L,
    ) -> Result<Option<WalkStep>, KexecError> {
        let word = match self.position {
            Position::Finished => return Ok(None),
            Position::Head(head) => {
                if !matches!(head & IND_FLAGS, IND_INDIRECTION | IND_DONE) {
                    return Err(KexecError::CorruptEntry(head));
                }
                head
            }
            Position::Slot(page, slot) => {
                if slot >= ENTRIES_PER_PAGE {
                    return Err(KexecError::UnterminatedList);
                }
                self.position = Position::Slot(page, slot + 1);
                list.list_word(page, slot)?
            }
        };

        let step = match Entry::from_word(word)? {
            Entry::Indirection(page) => {
                self.position = Position::Slot(page, 0);
                WalkStep::Indirection(page)
            }
            Entry::Destination(page) => {
                self.destination = Some(page);
                WalkStep::Destination(page)
            }
            Entry::Source(source) => {
                let destination = self
                    .destination
                    .ok_or(KexecError::SourceWithoutDestination)?;
                self.destination = destination.next();
                WalkStep::Source {
                    source,
                    destination,
                }
            }
            Entry::Done => {
                self.position = Position::Finished;
                WalkStep::Done
            }
        };
        Ok(Some(step))
    }
}

/// Visit every step of the list starting at `head`, ending with `Done`.
///
/// # Errors
/// Any traversal error of [`ListCursor::next`], or the first error returned
/// by `visit`.
pub fn walk<L, F>(head: u64, list: &L, mut visit: F) -> Result<(), KexecError>
where
    L: ListSource + ?Sized,
    F: FnMut(WalkStep) -> Result<(), KexecError>,
{
    let mut cursor = ListCursor::new(head);
    while let Some(step) = cursor.next(list)? {
        visit(step)?;
    }
    Ok(())
}

/// Execute a committed relocation list against `mem`: copy every source
/// page to its destination.
///
/// This is what the relocation routine does with the MMU off.
///
/// # Errors
/// Traversal errors and [`KexecError::PhysicalAccess`].
pub fn apply<M: PhysicalMemory + ?Sized>(head: u64, mem: &mut M) -> Result<(), KexecError> {
    let mut cursor = ListCursor::new(head);
    let mut page = [0u8; PAGE];
    loop {
        let step = cursor.next(&CommittedList::new(&*mem))?;
        let Some(step) = step else {
            return Ok(());
        };
        if let WalkStep::Source {
            source,
            destination,
        } = step
        {
            mem.read(source.base(), &mut page)?;
            mem.write(destination.base(), &page)?;
        }
    }
}

#[derive(Debug, Clone)]
struct ListPage {
    phys: PhysicalPage<Size4K>,
    entries: Vec<u64>,
}

/// An encoded relocation list and the pages it owns.
#[derive(Debug, Clone)]
pub struct RelocationProgram {
    head: u64,
    pages: Vec<ListPage>,
    sources: Vec<PhysicalPage<Size4K>>,
}

impl RelocationProgram {
    /// The program of an image that was loaded straight to its destination.
    #[must_use]
    pub const fn in_place() -> Self {
        Self {
            head: IND_DONE,
            pages: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Stage `segments` into freshly allocated source pages and encode the
    /// copy list.
    ///
    /// Pages handed out by `pages` that fall inside any destination are set
    /// aside during encoding and returned afterwards, so the copy never
    /// overwrites its own input.
    ///
    /// # Errors
    /// [`KexecError::UnalignedSegment`] for a destination that is not page
    /// aligned and [`KexecError::OutOfMemory`] if `pages` runs dry. On error
    /// every page taken so far is returned.
    pub fn encode<A, M>(
        segments: &[Segment<'_>],
        pages: &mut A,
        mem: &mut M,
    ) -> Result<Self, KexecError>
    where
        A: PageAllocator + ?Sized,
        M: PhysicalMemory + ?Sized,
    {
        let mut staging = Staging {
            alloc: pages,
            forbidden: segments.iter().map(Segment::range).collect(),
            set_aside: Vec::new(),
        };
        let mut program = Self {
            head: IND_DONE,
            pages: Vec::new(),
            sources: Vec::new(),
        };

        let result = program.fill(segments, &mut staging, mem);
        let Staging {
            alloc, set_aside, ..
        } = staging;
        for page in set_aside {
            alloc.free_page(page);
        }

        match result {
            Ok(()) => {
                debug!(
                    "relocation list: {} list page(s), {} source page(s)",
                    program.pages.len(),
                    program.sources.len()
                );
                Ok(program)
            }
            Err(e) => {
                program.release(alloc);
                Err(e)
            }
        }
    }

    fn fill<A, M>(
        &mut self,
        segments: &[Segment<'_>],
        staging: &mut Staging<'_, A>,
        mem: &mut M,
    ) -> Result<(), KexecError>
    where
        A: PageAllocator + ?Sized,
        M: PhysicalMemory + ?Sized,
    {
        let mut chunk = [0u8; PAGE];
        for segment in segments {
            let dest = PhysicalPage::try_from_addr(segment.mem())
                .ok_or(KexecError::UnalignedSegment(segment.range()))?;
            self.push(Entry::Destination(dest), staging)?;

            let mut rest = segment.buffer();
            for _ in 0..segment.pages() {
                let take = rest.len().min(PAGE);
                chunk[..take].copy_from_slice(&rest[..take]);
                chunk[take..].fill(0);
                rest = &rest[take..];

                let source = staging.page()?;
                self.sources.push(source);
                mem.write(source.base(), &chunk)?;
                self.push(Entry::Source(source), staging)?;
            }
        }

        // Done may take the last slot of a page; it never needs a successor.
        if let Some(last) = self.pages.last_mut() {
            last.entries.push(Entry::Done.into_word());
        }
        Ok(())
    }

    fn push<A: PageAllocator + ?Sized>(
        &mut self,
        entry: Entry,
        staging: &mut Staging<'_, A>,
    ) -> Result<(), KexecError> {
        // The last slot of a full page links to the next one.
        let needs_page = self
            .pages
            .last()
            .is_none_or(|last| last.entries.len() == ENTRIES_PER_PAGE - 1);
        if needs_page {
            let next = staging.page()?;
            let link = Entry::Indirection(next).into_word();
            match self.pages.last_mut() {
                Some(last) => last.entries.push(link),
                None => self.head = link,
            }
            self.pages.push(ListPage::new(next));
        }
        if let Some(last) = self.pages.last_mut() {
            last.entries.push(entry.into_word());
        }
        Ok(())
    }

    /// Raw head word, as handed to the relocation routine.
    #[inline]
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Whether the image is already in place and nothing is copied.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        self.head & IND_FLAGS == IND_DONE
    }

    pub fn list_pages(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + '_ {
        self.pages.iter().map(|p| p.phys)
    }

    /// The full 512-word image of list page `index`.
    #[must_use]
    pub fn page_words(&self, index: usize) -> Option<[u64; ENTRIES_PER_PAGE]> {
        let page = self.pages.get(index)?;
        let mut words = [0u64; ENTRIES_PER_PAGE];
        words[..page.entries.len()].copy_from_slice(&page.entries);
        Some(words)
    }

    /// Write every list page to physical memory.
    ///
    /// # Errors
    /// [`KexecError::PhysicalAccess`].
    pub fn commit<M: PhysicalMemory + ?Sized>(&self, mem: &mut M) -> Result<(), KexecError> {
        let mut bytes = [0u8; PAGE];
        for (index, page) in self.pages.iter().enumerate() {
            let words = self.page_words(index).unwrap_or([0; ENTRIES_PER_PAGE]);
            for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            mem.write(page.phys.base(), &bytes)?;
        }
        Ok(())
    }

    /// Walk the in-memory list.
    ///
    /// # Errors
    /// See [`walk`].
    pub fn walk<F>(&self, visit: F) -> Result<(), KexecError>
    where
        F: FnMut(WalkStep) -> Result<(), KexecError>,
    {
        walk(self.head, self, visit)
    }

    /// Clean every list page and every source page to the point of coherency.
    ///
    /// # Errors
    /// See [`walk`].
    pub fn flush_for_execution<C: CacheMaintenance + ?Sized>(
        &self,
        cache: &mut C,
    ) -> Result<(), KexecError> {
        self.walk(|step| {
            match step {
                WalkStep::Indirection(page) | WalkStep::Source { source: page, .. } => {
                    cache.clean_dcache_to_poc(page.base(), PAGE_SIZE);
                }
                WalkStep::Destination(_) | WalkStep::Done => {}
            }
            Ok(())
        })
    }

    /// Log the list at `verbosity`.
    ///
    /// # Errors
    /// See [`walk`].
    pub fn dump(&self, verbosity: DumpVerbosity) -> Result<(), KexecError> {
        if verbosity == DumpVerbosity::Off {
            return Ok(());
        }
        debug!("kexec_list_dump: head {:#018x}", self.head);
        self.walk(|step| {
            match step {
                WalkStep::Indirection(page) => debug!("  I: {}", page.base()),
                WalkStep::Destination(page) => debug!("  D: {}", page.base()),
                WalkStep::Source {
                    source,
                    destination,
                } => match verbosity {
                    DumpVerbosity::SourceMarks => debug!("S"),
                    DumpVerbosity::SourceDestinations => debug!("  S -> {}", destination.base()),
                    DumpVerbosity::Full => {
                        debug!("  S: {} -> {}", source.base(), destination.base());
                    }
                    DumpVerbosity::Off | DumpVerbosity::Entries => {}
                },
                WalkStep::Done => debug!("  DONE"),
            }
            Ok(())
        })
    }

    /// Return the list and source pages.
    pub fn release<A: PageAllocator + ?Sized>(self, pages: &mut A) {
        for page in self.pages.into_iter().map(|p| p.phys).chain(self.sources) {
            pages.free_page(page);
        }
    }
}

impl ListSource for RelocationProgram {
    fn list_word(&self, page: PhysicalPage<Size4K>, slot: usize) -> Result<u64, KexecError> {
        let list = self
            .pages
            .iter()
            .find(|p| p.phys == page)
            .ok_or(KexecError::PhysicalAccess(page.base().as_u64()))?;
        Ok(list.entries.get(slot).copied().unwrap_or(0))
    }
}

impl ListPage {
    fn new(phys: PhysicalPage<Size4K>) -> Self {
        Self {
            phys,
            entries: Vec::with_capacity(ENTRIES_PER_PAGE),
        }
    }
}

struct Staging<'a, A: ?Sized> {
    alloc: &'a mut A,
    forbidden: Vec<PhysicalRange>,
    set_aside: Vec<PhysicalPage<Size4K>>,
}

impl<A: PageAllocator + ?Sized> Staging<'_, A> {
    /// A page that no segment will be copied over.
    fn page(&mut self) -> Result<PhysicalPage<Size4K>, KexecError> {
        loop {
            let page = self.alloc.alloc_page().ok_or(OutOfMemory)?;
            let span = PhysicalRange::new(page.base(), page.last()).ok_or(KexecError::Overflow)?;
            if self.forbidden.iter().any(|r| r.overlaps(span)) {
                self.set_aside.push(page);
                continue;
            }
            return Ok(page);
        }
    }
}
