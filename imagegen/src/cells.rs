use ahash::AHashMap;

use crate::{layout::CodePart, object::ObjectId, registry::RoutineId};

/// Objects the image generator creates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Synthetic {
    /// Placed first so that no real object sits at the region start.
    Sentinel,
    HeapReferenceMap,
    /// Pads the heap up to a page boundary.
    Filler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CellKey {
    Object(ObjectId),
    Synthetic(Synthetic),
    Code(RoutineId, CodePart),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Heap,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub address: u64,
    pub size: u64,
    pub region: RegionKind,
}

impl Cell {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// Address of every placed object. Keys are unique and cells never overlap.
#[derive(Debug, Default)]
pub struct CellMap {
    cells: AHashMap<CellKey, Cell>,
}

impl CellMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `key` already has a cell.
    pub fn assign(&mut self, key: CellKey, cell: Cell) -> bool {
        if self.cells.contains_key(&key) {
            return false;
        }
        self.cells.insert(key, cell);
        true
    }

    pub fn get(&self, key: CellKey) -> Option<Cell> {
        self.cells.get(&key).copied()
    }

    pub fn address_of(&self, key: CellKey) -> Option<u64> {
        self.cells.get(&key).map(|c| c.address)
    }

    pub fn shift_region(&mut self, region: RegionKind, delta: u64) {
        for cell in self.cells.values_mut().filter(|c| c.region == region) {
            cell.address += delta;
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells sorted by address.
    pub fn sorted(&self) -> Vec<(CellKey, Cell)> {
        let mut cells: Vec<(CellKey, Cell)> = self.cells.iter().map(|(k, c)| (*k, *c)).collect();
        cells.sort_by_key(|(_, c)| c.address);
        cells
    }
}

pub const DEBUG_TAG: u64 = 0xDEAD_BEEF;

/// Bump allocator over one region. With tagging on, every cell is
/// preceded by one tag word.
#[derive(Debug, Clone)]
pub struct LinearRegion {
    pub kind: RegionKind,
    start: u64,
    mark: u64,
    word_size: u64,
    tagging: bool,
}

impl LinearRegion {
    pub fn new(kind: RegionKind, start: u64, word_size: usize, tagging: bool) -> Self {
        Self {
            kind,
            start,
            mark: start,
            word_size: word_size as u64,
            tagging,
        }
    }

    pub fn allocate(&mut self, size: u64) -> Cell {
        if self.tagging {
            self.mark += self.word_size;
        }
        let cell = Cell {
            address: self.mark,
            size,
            region: self.kind,
        };
        self.mark += size;
        cell
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn mark(&self) -> u64 {
        self.mark
    }

    pub fn size(&self) -> u64 {
        self.mark - self.start
    }

    pub fn tag_size(&self) -> u64 {
        if self.tagging { self.word_size } else { 0 }
    }

    pub fn shift(&mut self, delta: u64) {
        self.start += delta;
        self.mark += delta;
    }
}
