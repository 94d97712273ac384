use std::{borrow::Cow, io, thread};

use crate::{
    cells::{Cell, CellKey, CellMap, DEBUG_TAG, LinearRegion, RegionKind, Synthetic},
    closure::Closure,
    layout::{CellVisitor, CodeBundle, CodePart, LayoutError, ObjectLayout},
    linker::{self, DispatchPatches, SlotOutOfRange},
    object::{Field, HeapObject, LiveObjects, ObjectGraph, ObjectId, Value},
    registry::{RegistryImpl, RoutineId},
    relocation::{self, PointerScope, WordBitmap},
    settings::{DataModel, ImageSettings, align_up},
};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("{object:?} was reached after the closure was fixed and has no cell; path {path:?}")]
    MissingCell { object: ObjectId, path: Vec<ObjectId> },
    #[error("invalid layout for {key:?}: {source}")]
    Layout {
        key: CellKey,
        #[source]
        source: LayoutError,
    },
    #[error("code bundle of {routine:?} is {actual} bytes, expected {expected}")]
    BundleSize {
        routine: RoutineId,
        expected: u64,
        actual: u64,
    },
    #[error("wrote {written} bytes into the {region:?} region, expected {expected}")]
    RegionSize {
        region: RegionKind,
        expected: u64,
        written: u64,
    },
    #[error(transparent)]
    Dispatch(#[from] SlotOutOfRange),
    #[error("failed to spawn serializer thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("serializer thread panicked")]
    WorkerPanicked,
}

/// An object together with its final cell.
#[derive(Debug, Clone)]
pub struct Placed<'a> {
    pub key: CellKey,
    pub cell: Cell,
    pub object: Cow<'a, HeapObject>,
}

/// Cells for every live object and code sub-object, in two regions: the
/// heap starting at zero and the code right after it.
#[derive(Debug)]
pub struct Placement<'a> {
    pub layout: ObjectLayout,
    pub cells: CellMap,
    pub patches: DispatchPatches,
    /// Heap cells in address order, sentinel first.
    pub heap: Vec<Placed<'a>>,
    /// Code cells in address order.
    pub code: Vec<Placed<'a>>,
    pub heap_size: u64,
    pub code_start: u64,
    pub code_size: u64,
    code_used: u64,
    pub mutable_heap_size: u64,
    pub heap_reference_map: u64,
    live: &'a LiveObjects,
    tag_size: u64,
    batch_size: usize,
    threads: usize,
}

impl<'a> Placement<'a> {
    /// Assigns every cell: code bundles first, then the heap, then moves
    /// the code region behind the heap.
    pub fn assign(
        settings: &ImageSettings,
        registry: &RegistryImpl,
        graph: &'a ObjectGraph,
        live: &'a LiveObjects,
        closure: &Closure,
    ) -> Result<Self, PlacementError> {
        let model = settings.data_model;
        let layout = ObjectLayout::new(model);
        let page = settings.page_size as u64;
        let mut cells = CellMap::new();

        let mut code_region = LinearRegion::new(RegionKind::Code, 0, model.word_size, settings.debug_tagging);
        let mut code = Vec::new();
        for compiled in closure.compiled_routines() {
            let routine = compiled.routine;
            let bundle = CodeBundle::new(compiled, &graph.hubs);
            let expected = bundle.size(&layout).map_err(|source| PlacementError::Layout {
                key: CellKey::Code(routine, CodePart::Code),
                source,
            })? + bundle.parts.len() as u64 * code_region.tag_size();
            let before = code_region.mark();
            for (part, object) in bundle.parts {
                let key = CellKey::Code(routine, part);
                place(&layout, &mut code_region, &mut cells, &mut code, key, Cow::Owned(object))?;
            }
            let actual = code_region.mark() - before;
            if actual != expected {
                return Err(PlacementError::BundleSize {
                    routine,
                    expected,
                    actual,
                });
            }
        }
        log::debug!("assigned {} code cells, {} bytes", code.len(), code_region.size());

        let code_entry = |routine: RoutineId| {
            let compiled = closure.compiled(routine)?;
            let cell = cells.address_of(CellKey::Code(routine, CodePart::Code))?;
            Some(cell + layout.array_header_size() + compiled.entry_offset as u64)
        };
        let types = closure.accounted_types();
        let mut patches = linker::link_dispatch_tables(registry, graph, &types, code_entry)?;

        let mut heap_region = LinearRegion::new(RegionKind::Heap, 0, model.word_size, settings.debug_tagging);
        let mut heap = Vec::new();
        let sentinel_object = HeapObject::tuple(graph.hubs.object, layout.tuple_header_size() as u32, vec![]);
        let sentinel = CellKey::Synthetic(Synthetic::Sentinel);
        place(&layout, &mut heap_region, &mut cells, &mut heap, sentinel, Cow::Owned(sentinel_object))?;
        for id in live.iter().filter(|&id| graph.get(id).mutable_references) {
            place(&layout, &mut heap_region, &mut cells, &mut heap, CellKey::Object(id), Cow::Borrowed(graph.get(id)))?;
        }

        let mutable_heap_size = heap_region.mark();
        let reference_map = build_heap_reference_map(&layout, &heap, &patches, mutable_heap_size);
        let reference_map = HeapObject::bytes(graph.hubs.byte_array, reference_map.to_bytes(model.endianness));
        place(
            &layout,
            &mut heap_region,
            &mut cells,
            &mut heap,
            CellKey::Synthetic(Synthetic::HeapReferenceMap),
            Cow::Owned(reference_map),
        )?;
        for id in live.iter().filter(|&id| !graph.get(id).mutable_references) {
            place(&layout, &mut heap_region, &mut cells, &mut heap, CellKey::Object(id), Cow::Borrowed(graph.get(id)))?;
        }

        let mark = heap_region.mark();
        let mut gap = align_up(mark, page) - mark;
        if gap != 0 {
            let smallest = heap_region.tag_size() + layout.array_header_size();
            if gap < smallest {
                gap += page;
            }
            let filler = HeapObject::bytes(graph.hubs.byte_array, vec![0; (gap - smallest) as usize]);
            let filler_key = CellKey::Synthetic(Synthetic::Filler);
            place(&layout, &mut heap_region, &mut cells, &mut heap, filler_key, Cow::Owned(filler))?;
        }

        let heap_size = heap_region.mark();
        debug_assert_eq!(heap_size % page, 0);
        let heap_reference_map = cells
            .address_of(CellKey::Synthetic(Synthetic::HeapReferenceMap))
            .unwrap_or_default();

        let code_start = heap_size;
        cells.shift_region(RegionKind::Code, code_start);
        patches.shift(code_start);
        code_region.shift(code_start);
        for placed in &mut code {
            placed.cell.address += code_start;
        }
        let code_used = code_region.size();
        let code_size = align_up(code_used, page);
        log::info!(
            "placed {} heap cells ({heap_size} bytes, {mutable_heap_size} mutable) and {} code cells ({code_size} bytes)",
            heap.len(),
            code.len()
        );

        Ok(Self {
            layout,
            cells,
            patches,
            heap,
            code,
            heap_size,
            code_start,
            code_size,
            code_used,
            mutable_heap_size,
            heap_reference_map,
            live,
            tag_size: heap_region.tag_size(),
            batch_size: settings.batch_size,
            threads: settings.serializer_threads,
        })
    }

    pub fn model(&self) -> &DataModel {
        self.layout.model()
    }

    /// Entry address of the compiled form of `routine`.
    pub fn entry_address(&self, routine: RoutineId, entry_offset: u32) -> Option<u64> {
        self.cells
            .address_of(CellKey::Code(routine, CodePart::Code))
            .map(|cell| cell + self.layout.array_header_size() + entry_offset as u64)
    }

    pub fn address_of(&self, object: ObjectId) -> Option<u64> {
        self.cells.address_of(CellKey::Object(object))
    }

    pub fn placed(&self) -> impl Iterator<Item = &Placed<'a>> {
        self.heap.iter().chain(self.code.iter())
    }

    /// Writes the heap and code regions.
    pub fn serialize(&self) -> Result<(Vec<u8>, Vec<u8>), PlacementError> {
        let heap = self.write_region(RegionKind::Heap, &self.heap, 0, self.heap_size, self.heap_size)?;
        let code = self.write_region(RegionKind::Code, &self.code, self.code_start, self.code_used, self.code_size)?;
        Ok((heap, code))
    }

    fn write_region(
        &self,
        region: RegionKind,
        placed: &[Placed<'a>],
        start: u64,
        used: u64,
        size: u64,
    ) -> Result<Vec<u8>, PlacementError> {
        let mut data = vec![0u8; size as usize];
        let batches: Vec<&[Placed<'a>]> = placed.chunks(self.batch_size).collect();

        // Batches cover disjoint address ranges, so the buffer is split
        // at each batch's first cell.
        let mut work = Vec::with_capacity(batches.len());
        let mut rest: &mut [u8] = &mut data;
        let mut base = start;
        for (i, batch) in batches.iter().enumerate() {
            let end = match batches.get(i + 1) {
                Some(next) => next[0].cell.address - self.tag_size,
                None => start + size,
            };
            let (head, tail) = std::mem::take(&mut rest).split_at_mut((end - base) as usize);
            work.push((base, *batch, head));
            rest = tail;
            base = end;
        }

        let written: u64 = fork_join("write", self.threads, work, |(base, batch, out)| {
            self.write_batch(base, batch, out)
        })?
        .into_iter()
        .sum();
        if written != used {
            return Err(PlacementError::RegionSize {
                region,
                expected: used,
                written,
            });
        }
        log::debug!("wrote {written} bytes of the {region:?} region in {} batches", batches.len());
        Ok(data)
    }

    fn write_batch(&self, base: u64, batch: &[Placed<'a>], out: &mut [u8]) -> Result<u64, PlacementError> {
        let model = *self.model();
        let mut written = 0;
        for placed in batch {
            if self.tag_size != 0 {
                let at = (placed.cell.address - self.tag_size - base) as usize;
                model.encode_word(DEBUG_TAG, &mut out[at..at + model.word_size]);
            }
            let mut writer = CellWriter {
                out: &mut *out,
                at: placed.cell.address - base,
                model,
                cells: &self.cells,
                patches: &self.patches,
                key: placed.key,
                missing: None,
            };
            self.layout.visit_cell(&placed.object, &mut writer);
            if let Some(object) = writer.missing {
                let mut path = match placed.key {
                    CellKey::Object(referrer) => self.live.path_to(referrer),
                    _ => Vec::new(),
                };
                path.push(object);
                return Err(PlacementError::MissingCell { object, path });
            }
            written += self.tag_size + placed.cell.size;
        }
        Ok(written)
    }

    /// Marks every pointer word of the heap and code regions.
    pub fn relocation_map(&self) -> Result<WordBitmap, PlacementError> {
        let placed: Vec<&Placed<'a>> = self.placed().collect();
        let batches: Vec<&[&Placed<'a>]> = placed.chunks(self.batch_size).collect();
        let marked = fork_join("relocate", self.threads, batches, |batch| {
            let mut addresses = Vec::new();
            for placed in batch {
                let offsets = relocation::pointer_offsets(
                    &self.layout,
                    placed.key,
                    &placed.object,
                    &self.patches,
                    PointerScope::Relocation,
                );
                addresses.extend(offsets.into_iter().map(|o| placed.cell.address + o));
            }
            Ok(addresses)
        })?;

        let mut map = WordBitmap::new(self.heap_size + self.code_size, self.model().word_size);
        for address in marked.into_iter().flatten() {
            map.mark(address);
        }
        log::debug!("marked {} of {} words for relocation", map.count(), map.words());
        Ok(map)
    }
}

fn cell_size(layout: &ObjectLayout, key: CellKey, object: &HeapObject) -> Result<u64, PlacementError> {
    layout
        .cell_size(object)
        .map_err(|source| PlacementError::Layout { key, source })
}

/// Allocates a cell for `key` unless it already has one.
fn place<'a>(
    layout: &ObjectLayout,
    region: &mut LinearRegion,
    cells: &mut CellMap,
    placed: &mut Vec<Placed<'a>>,
    key: CellKey,
    object: Cow<'a, HeapObject>,
) -> Result<(), PlacementError> {
    if cells.get(key).is_some() {
        return Ok(());
    }
    let cell = region.allocate(cell_size(layout, key, &object)?);
    cells.assign(key, cell);
    placed.push(Placed { key, cell, object });
    Ok(())
}

/// Bitmap over the mutable prefix of the heap marking the reference
/// words of mutable objects.
fn build_heap_reference_map(
    layout: &ObjectLayout,
    placed: &[Placed<'_>],
    patches: &DispatchPatches,
    mutable_heap_size: u64,
) -> WordBitmap {
    let mut map = WordBitmap::new(mutable_heap_size, layout.model().word_size);
    for placed in placed.iter().filter(|p| p.object.mutable_references) {
        for offset in relocation::pointer_offsets(
            layout,
            placed.key,
            &placed.object,
            patches,
            PointerScope::MutableReferences,
        ) {
            map.mark(placed.cell.address + offset);
        }
    }
    map
}

struct CellWriter<'b> {
    out: &'b mut [u8],
    // cell start relative to `out`
    at: u64,
    model: DataModel,
    cells: &'b CellMap,
    patches: &'b DispatchPatches,
    key: CellKey,
    missing: Option<ObjectId>,
}

impl CellWriter<'_> {
    fn write(&mut self, offset: u64, value: Value) {
        let bits = match value {
            Value::Reference(None) => 0,
            Value::Reference(Some(target)) => match self.cells.address_of(CellKey::Object(target)) {
                Some(address) => address,
                None => {
                    self.missing.get_or_insert(target);
                    0
                }
            },
            other => other.bits(),
        };
        let width = value.width(self.model.word_size);
        let start = (self.at + offset) as usize;
        self.model.endianness.encode(bits, &mut self.out[start..start + width]);
    }
}

impl CellVisitor for CellWriter<'_> {
    fn visit_header(&mut self, offset: u64, _: &'static str, value: Value) {
        self.write(offset, value);
    }

    fn visit_field(&mut self, offset: u64, field: &Field) {
        let value = match field {
            Field {
                value: Value::Reference(_),
                relocation_exempt: true,
                ..
            } => Value::NULL,
            _ => field.value,
        };
        self.write(offset, value);
    }

    fn visit_element(&mut self, offset: u64, index: usize, value: Value) {
        let patched = match self.key {
            CellKey::Object(table) => self.patches.get(table, index),
            _ => None,
        };
        match (value, patched) {
            (Value::Word(_), Some(address)) => self.write(offset, Value::Word(address)),
            _ => self.write(offset, value),
        }
    }
}

/// Runs `f` over `work` on up to `threads` named threads, returning the
/// results in input order.
fn fork_join<W, T, F>(name: &str, threads: usize, work: Vec<W>, f: F) -> Result<Vec<T>, PlacementError>
where
    W: Send,
    T: Send,
    F: Fn(W) -> Result<T, PlacementError> + Sync,
{
    if threads <= 1 || work.len() <= 1 {
        return work.into_iter().map(&f).collect();
    }

    let lanes = threads.min(work.len());
    let mut queues: Vec<Vec<(usize, W)>> = (0..lanes).map(|_| Vec::new()).collect();
    for (i, item) in work.into_iter().enumerate() {
        queues[i % lanes].push((i, item));
    }

    let f = &f;
    let mut results = thread::scope(|s| {
        let mut handles = Vec::with_capacity(lanes);
        for (lane, queue) in queues.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("imagegen-{name}-{lane}"))
                .spawn_scoped(s, move || {
                    queue
                        .into_iter()
                        .map(|(i, item)| f(item).map(|result| (i, result)))
                        .collect::<Result<Vec<_>, PlacementError>>()
                })?;
            handles.push(handle);
        }
        let mut results = Vec::new();
        for handle in handles {
            results.extend(handle.join().map_err(|_| PlacementError::WorkerPanicked)??);
        }
        Ok::<_, PlacementError>(results)
    })?;
    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, result)| result).collect())
}
