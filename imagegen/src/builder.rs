use std::{path::PathBuf, sync::Arc};

use crate::{
    Error, Result,
    closure::{Closure, InvalidationQueue},
    compiler::{CompiledRoutine, Compiler},
    image::{BootImage, Header, StringInfo},
    object::{LiveObjects, ObjectGraph, ObjectId},
    placement::Placement,
    registry::{Registry, RoutineId},
    report,
    settings::ImageSettings,
};

/// Everything a build step may consult. Passed explicitly; there is no
/// process-wide build state.
pub struct BuildContext {
    pub settings: ImageSettings,
    pub registry: Registry,
    pub compiler: Arc<dyn Compiler>,
    pub invalidations: InvalidationQueue,
}

impl BuildContext {
    pub fn new(settings: ImageSettings, registry: Registry, compiler: Arc<dyn Compiler>) -> Self {
        Self {
            settings,
            registry,
            compiler,
            invalidations: InvalidationQueue::default(),
        }
    }
}

/// A word inside a tuple whose final address goes into the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub object: ObjectId,
    pub offset: u32,
}

/// Routines and objects the native loader locates through the header.
#[derive(Debug, Clone, Default)]
pub struct ImageAnchors {
    pub vm_run: Option<RoutineId>,
    pub vm_thread_add: Option<RoutineId>,
    pub vm_thread_run: Option<RoutineId>,
    pub vm_thread_attach: Option<RoutineId>,
    pub vm_thread_detach: Option<RoutineId>,
    pub class_registry: Option<ObjectId>,
    pub dynamic_heap_regions: Option<FieldRef>,
    pub reserved_virtual_space: Option<FieldRef>,
    pub tla_list_head: Option<FieldRef>,
    pub exit_code: Option<FieldRef>,
}

impl ImageAnchors {
    fn routines(&self) -> impl Iterator<Item = (&'static str, Option<RoutineId>)> {
        [
            ("vmRunMethodOffset", self.vm_run),
            ("vmThreadAddMethodOffset", self.vm_thread_add),
            ("vmThreadRunMethodOffset", self.vm_thread_run),
            ("vmThreadAttachMethodOffset", self.vm_thread_attach),
            ("vmThreadDetachMethodOffset", self.vm_thread_detach),
        ]
        .into_iter()
    }

    fn fields(&self) -> impl Iterator<Item = (&'static str, Option<FieldRef>)> {
        [
            ("dynamicHeapRegionsArrayFieldOffset", self.dynamic_heap_regions),
            ("reservedVirtualSpaceFieldOffset", self.reserved_virtual_space),
            ("tlaListHeadOffset", self.tla_list_head),
            ("exitCodeOffset", self.exit_code),
        ]
        .into_iter()
    }

    fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.class_registry
            .into_iter()
            .chain(self.fields().filter_map(|(_, f)| f.map(|f| f.object)))
    }
}

/// Where to save the auxiliary reports. Unset paths are skipped.
#[derive(Debug, Clone, Default)]
pub struct ReportPaths {
    pub links: Option<PathBuf>,
    pub regions: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub links: usize,
    pub compiled_routines: usize,
    pub compilations: usize,
    pub live_objects: usize,
    pub heap_cells: usize,
    pub code_cells: usize,
    pub relocated_words: usize,
}

#[derive(Debug)]
pub struct BuiltImage {
    pub image: BootImage,
    pub stats: BuildStats,
}

/// Drives a build: closure, placement, serialization and packaging.
pub struct ImageBuilder {
    ctx: BuildContext,
    closure: Closure,
    roots: Vec<ObjectId>,
    anchors: ImageAnchors,
    reports: ReportPaths,
}

impl ImageBuilder {
    pub fn new(ctx: BuildContext) -> Self {
        Self {
            ctx,
            closure: Closure::new(),
            roots: Vec::new(),
            anchors: ImageAnchors::default(),
            reports: ReportPaths::default(),
        }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn closure(&self) -> &Closure {
        &self.closure
    }

    pub fn add_precompiled(&mut self, compiled: CompiledRoutine) {
        self.closure.add_precompiled(&self.ctx, compiled);
    }

    pub fn add_entry_point(&mut self, routine: RoutineId) -> bool {
        self.closure.add_entry_point(&self.ctx, routine)
    }

    pub fn add_entry_points_by_name(&mut self, name: &str) -> Result<usize> {
        Ok(self.closure.add_entry_points_by_name(&self.ctx, name)?)
    }

    pub fn add_invocation_stub(&mut self, routine: RoutineId) -> bool {
        self.closure.add_invocation_stub(&self.ctx, routine)
    }

    pub fn add_root(&mut self, object: ObjectId) {
        self.roots.push(object);
    }

    pub fn set_anchors(&mut self, anchors: ImageAnchors) {
        self.anchors = anchors;
    }

    pub fn set_reports(&mut self, reports: ReportPaths) {
        self.reports = reports;
    }

    /// Runs the closure to a fixpoint, then precompiles foldable routines
    /// and each extra entry point in turn.
    pub fn compile(&mut self, extra_entry_points: &[&str]) -> Result<()> {
        let anchored: Vec<RoutineId> = self.anchors.routines().filter_map(|(_, r)| r).collect();
        for routine in anchored {
            self.closure.add_entry_point(&self.ctx, routine);
        }
        self.closure.compile(&self.ctx)?;
        self.closure.compile_foldable_routines(&self.ctx)?;
        for name in extra_entry_points {
            self.closure.compile_extra_entry_point(&self.ctx, name)?;
        }
        log::info!(
            "closure converged: {} links, {} compiled routines, {} compilations",
            self.closure.link_count(),
            self.closure.compiled_count(),
            self.closure.total_compilations()
        );
        Ok(())
    }

    /// Places and serializes `graph` together with the compiled closure.
    pub fn build(&self, graph: &ObjectGraph) -> Result<BuiltImage> {
        let settings = &self.ctx.settings;
        // placement divides by page size and alignment
        Header::from_settings(settings).check()?;
        let registry = self.ctx.registry.read();

        let types = self.closure.accounted_types();
        let hubs = graph.hubs;
        let roots = self
            .roots
            .iter()
            .copied()
            .chain(self.anchors.objects())
            .chain([hubs.object, hubs.byte_array, hubs.reference_array, hubs.word_array].into_iter().flatten())
            .chain(types.iter().flat_map(|&ty| {
                let def = registry.ty(ty);
                def.hub.into_iter().chain(def.dispatch_table)
            }))
            .chain(
                self.closure
                    .compiled_routines()
                    .flat_map(|c| c.reference_literals.iter().copied()),
            );
        let live = LiveObjects::gather(graph, roots);

        let placement = Placement::assign(settings, &registry, graph, &live, &self.closure)?;
        let (heap, code) = placement.serialize()?;
        let relocation = placement.relocation_map()?;
        let relocated_words = relocation.count();

        let header = self.header(&placement)?;
        let image = BootImage::new(
            header,
            StringInfo::from_settings(settings),
            relocation.to_bytes(settings.data_model.endianness),
            heap,
            code,
        )?;

        if let Some(path) = &self.reports.links {
            report::save(path, |w| report::write_link_report(w, &registry, &self.closure));
        }
        if let Some(path) = &self.reports.regions {
            report::save(path, |w| report::write_region_map(w, &registry, &placement));
        }

        let stats = BuildStats {
            links: self.closure.link_count(),
            compiled_routines: self.closure.compiled_count(),
            compilations: self.closure.total_compilations(),
            live_objects: live.len(),
            heap_cells: placement.heap.len(),
            code_cells: placement.code.len(),
            relocated_words,
        };
        log::info!(
            "built image: {} bytes, {} live objects, {} relocated words",
            image.file_size(),
            stats.live_objects,
            stats.relocated_words
        );
        Ok(BuiltImage { image, stats })
    }

    fn header(&self, placement: &Placement<'_>) -> Result<Header> {
        let mut header = Header::from_settings(&self.ctx.settings);

        let mut entries = [0i32; 5];
        for (slot, (field, routine)) in entries.iter_mut().zip(self.anchors.routines()) {
            let Some(routine) = routine else { continue };
            let address = self
                .closure
                .compiled(routine)
                .and_then(|c| placement.entry_address(routine, c.entry_offset))
                .ok_or(Error::Unplaced(field))?;
            *slot = to_header(field, address)?;
        }
        [
            header.vm_run_method_offset,
            header.vm_thread_add_method_offset,
            header.vm_thread_run_method_offset,
            header.vm_thread_attach_method_offset,
            header.vm_thread_detach_method_offset,
        ] = entries;

        if let Some(registry) = self.anchors.class_registry {
            let address = placement
                .address_of(registry)
                .ok_or(Error::Unplaced("classRegistryOffset"))?;
            header.class_registry_offset = to_header("classRegistryOffset", address)?;
        }

        let mut fields = [0i32; 4];
        for (slot, (field, target)) in fields.iter_mut().zip(self.anchors.fields()) {
            let Some(target) = target else { continue };
            let address = placement
                .address_of(target.object)
                .ok_or(Error::Unplaced(field))?;
            *slot = to_header(field, address + target.offset as u64)?;
        }
        [
            header.dynamic_heap_regions_array_field_offset,
            header.reserved_virtual_space_field_offset,
            header.tla_list_head_offset,
            header.exit_code_offset,
        ] = fields;

        header.heap_reference_map_offset = to_header("heapReferenceMapOffset", placement.heap_reference_map)?;
        header.mutable_heap_size = to_header("mutableHeapSize", placement.mutable_heap_size)?;
        Ok(header)
    }
}

fn to_header(field: &'static str, value: u64) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::HeaderOverflow { field, value })
}
