use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::{
        Arc,
        mpsc::{self, Receiver, SyncSender},
    },
    thread,
};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::{
    builder::BuildContext,
    compiler::{CompileError, CompiledRoutine},
    registry::{RegistryImpl, RoutineFlags, RoutineId, TypeId},
    settings::ImageSettings,
};

const PROGRESS_INTERVAL: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relationship {
    DirectCall,
    VirtualCall,
    InterfaceCall,
    LiteralReference,
    Implements,
    Overrides,
}

impl Relationship {
    pub fn is_indirect(self) -> bool {
        matches!(self, Self::VirtualCall | Self::InterfaceCall)
    }

    /// Reads as "parent <verb> child".
    pub fn as_parent(self) -> &'static str {
        match self {
            Self::DirectCall => "directly calls",
            Self::VirtualCall => "virtually calls",
            Self::InterfaceCall => "interface calls",
            Self::LiteralReference => "references",
            Self::Implements => "is implemented by",
            Self::Overrides => "is overridden by",
        }
    }

    /// Reads as "child <verb> parent".
    pub fn as_child(self) -> &'static str {
        match self {
            Self::DirectCall => "is directly called by",
            Self::VirtualCall => "is virtually called by",
            Self::InterfaceCall => "is interface called by",
            Self::LiteralReference => "is referenced by",
            Self::Implements => "implements",
            Self::Overrides => "overrides",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cause {
    pub parent: RoutineId,
    pub relationship: Relationship,
}

/// Why a routine is in the closure. Entry points have no cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub child: RoutineId,
    pub cause: Option<Cause>,
}

impl Link {
    pub fn parent(&self) -> Option<RoutineId> {
        self.cause.map(|c| c.parent)
    }

    pub fn relationship(&self) -> Option<Relationship> {
        self.cause.map(|c| c.relationship)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeClosureInfo {
    /// Routines of this type that were called virtually or through an
    /// interface. Every subtype's override of them is linked.
    pub indirect_calls: BTreeSet<RoutineId>,
    pub subclasses: BTreeSet<TypeId>,
    pub implementors: BTreeSet<TypeId>,
}

/// Routines whose compiled form must be discarded. Shared with whatever
/// detects broken assumptions; only the controller drains it.
#[derive(Debug, Clone, Default)]
pub struct InvalidationQueue(Arc<Mutex<BTreeSet<RoutineId>>>);

impl InvalidationQueue {
    pub fn invalidate(&self, routine: RoutineId) {
        self.0.lock().insert(routine);
    }

    pub fn take(&self) -> BTreeSet<RoutineId> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Link chain from a routine back to the entry point that made it
/// reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentChain(Vec<String>);

impl ParentChain {
    pub fn lines(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ParentChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Parent chain:")?;
        for line in &self.0 {
            writeln!(f, "    {line}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to compile {routine}: {source}\n{chain}")]
    Compilation {
        routine: String,
        #[source]
        source: CompileError,
        chain: ParentChain,
    },
    #[error("no routine matches entry point {0}")]
    UnknownEntryPoint(String),
    #[error("failed to spawn compiler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("compiler threads exited before the worklist drained")]
    PoolDisconnected,
}

type Completion = (RoutineId, Result<CompiledRoutine, CompileError>);

/// The set of routines and types reachable from the entry points, and
/// the compiled form of every routine that needed one.
#[derive(Debug, Default)]
pub struct Closure {
    types: AHashMap<TypeId, TypeClosureInfo>,
    // types enclosed by a routine, parked until that routine is inlined
    anonymous_types: AHashMap<RoutineId, BTreeSet<TypeId>>,
    routines_with_inlining: AHashSet<RoutineId>,
    links: AHashMap<RoutineId, Link>,
    worklist: VecDeque<RoutineId>,
    compiled: BTreeMap<RoutineId, Arc<CompiledRoutine>>,
    in_flight: AHashSet<RoutineId>,
    stale: AHashSet<RoutineId>,
    total_compilations: usize,
}

impl Closure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `child` into the closure. Returns true if it was newly
    /// scheduled for compilation.
    pub fn add(&mut self, ctx: &BuildContext, child: Option<RoutineId>, cause: Option<Cause>) -> bool {
        let registry = ctx.registry.read();
        self.link(&registry, child, cause)
    }

    pub fn add_entry_point(&mut self, ctx: &BuildContext, routine: RoutineId) -> bool {
        self.add(ctx, Some(routine), None)
    }

    /// Adds every routine matching `Holder.name` or `Holder.*` as an entry
    /// point, returning how many were newly scheduled.
    pub fn add_entry_points_by_name(&mut self, ctx: &BuildContext, name: &str) -> Result<usize, BuildError> {
        let registry = ctx.registry.read();
        let routines = registry
            .find_by_qualified_name(name)
            .filter(|routines| !routines.is_empty())
            .ok_or_else(|| BuildError::UnknownEntryPoint(name.to_owned()))?;
        Ok(routines
            .into_iter()
            .filter(|&r| self.link(&registry, Some(r), None))
            .count())
    }

    /// Adds the local virtual routines of `routine`'s invocation stub type
    /// as entry points.
    pub fn add_invocation_stub(&mut self, ctx: &BuildContext, routine: RoutineId) -> bool {
        let registry = ctx.registry.read();
        let Some(stub) = registry.routine(routine).invocation_stub else {
            return false;
        };
        let mut added = false;
        for r in registry.local_virtual_routines(stub) {
            added |= self.link(&registry, Some(r), None);
        }
        added
    }

    /// Registers code that exists without going through the compiler.
    /// The routine becomes an entry point and is never enqueued.
    pub fn add_precompiled(&mut self, ctx: &BuildContext, compiled: CompiledRoutine) {
        let registry = ctx.registry.read();
        let routine = compiled.routine;
        self.links.entry(routine).or_insert(Link {
            child: routine,
            cause: None,
        });
        let compiled = Arc::new(compiled);
        self.compiled.insert(routine, Arc::clone(&compiled));
        self.fold(&registry, &compiled);
    }

    fn link(&mut self, registry: &RegistryImpl, child: Option<RoutineId>, cause: Option<Cause>) -> bool {
        let Some(child) = child else {
            return false;
        };
        if let Some(cause) = cause {
            if cause.parent == child {
                return false;
            }
            if cause.relationship.is_indirect() {
                self.record_indirect_call(registry, child, cause.relationship);
            }
        }
        if self.links.contains_key(&child) {
            return false;
        }

        let def = registry.routine(child);
        if def.flags.contains(RoutineFlags::FOLDABLE) {
            if let Some(stub) = def.invocation_stub {
                for r in registry.local_virtual_routines(stub) {
                    self.link(registry, Some(r), cause);
                }
            }
        }

        self.links.insert(child, Link { child, cause });
        if self.compiled.contains_key(&child) {
            return false;
        }
        self.worklist.push_back(child);
        true
    }

    fn record_indirect_call(&mut self, registry: &RegistryImpl, routine: RoutineId, relationship: Relationship) {
        let holder = registry.routine(routine).holder;
        self.account_for(registry, holder);
        let Some(info) = self.types.get_mut(&holder) else {
            return;
        };
        if !info.indirect_calls.insert(routine) {
            return;
        }
        let (receivers, relationship) = match relationship {
            Relationship::VirtualCall => (info.subclasses.iter().copied().collect::<Vec<_>>(), Relationship::Overrides),
            _ => (info.implementors.iter().copied().collect(), Relationship::Implements),
        };
        for receiver in receivers {
            self.link_overrides(registry, receiver, &[routine], relationship);
        }
    }

    fn link_overrides(&mut self, registry: &RegistryImpl, receiver: TypeId, called: &[RoutineId], relationship: Relationship) {
        for &m in called {
            let def = registry.routine(m);
            let target = registry.find_virtual(receiver, &def.name, &def.descriptor);
            self.link(registry, target, Some(Cause { parent: m, relationship }));
        }
    }

    /// Records `ty` under its supertypes and interfaces and links its
    /// overrides of routines that were already called indirectly.
    fn account_for(&mut self, registry: &RegistryImpl, ty: TypeId) {
        if self.types.contains_key(&ty) {
            return;
        }
        self.types.insert(ty, TypeClosureInfo::default());

        for sup in registry.all_super_types(ty) {
            self.account_for(registry, sup);
            let called = match self.types.get_mut(&sup) {
                Some(info) => {
                    info.subclasses.insert(ty);
                    info.indirect_calls.iter().copied().collect::<Vec<_>>()
                }
                None => continue,
            };
            self.link_overrides(registry, ty, &called, Relationship::Overrides);
        }

        if registry.ty(ty).is_interface() {
            return;
        }
        for interface in registry.all_interfaces(ty) {
            self.account_for(registry, interface);
            let called = match self.types.get_mut(&interface) {
                Some(info) => {
                    info.implementors.insert(ty);
                    info.indirect_calls.iter().copied().collect::<Vec<_>>()
                }
                None => continue,
            };
            self.link_overrides(registry, ty, &called, Relationship::Implements);
        }
    }

    /// Accounts for every loaded type the closure has not seen yet.
    /// Returns how many were processed.
    pub fn gather_new_types(&mut self, ctx: &BuildContext) -> usize {
        let registry = ctx.registry.read();
        let mut fresh = Vec::new();
        for ty in registry.loaded_types() {
            if self.types.contains_key(&ty) {
                continue;
            }
            match registry.ty(ty).enclosing_routine {
                Some(enclosing) => {
                    self.anonymous_types.entry(enclosing).or_default().insert(ty);
                    if self.routines_with_inlining.contains(&enclosing) {
                        fresh.push(ty);
                    }
                }
                None => fresh.push(ty),
            }
        }
        for &ty in &fresh {
            self.account_for(&registry, ty);
        }
        if !fresh.is_empty() {
            log::debug!("accounted for {} new types", fresh.len());
        }
        fresh.len()
    }

    fn fold(&mut self, registry: &RegistryImpl, compiled: &CompiledRoutine) {
        let parent = compiled.routine;
        let edges = [
            (&compiled.literal_routines, Relationship::LiteralReference),
            (&compiled.direct_callees, Relationship::DirectCall),
            (&compiled.virtual_callees, Relationship::VirtualCall),
            (&compiled.interface_callees, Relationship::InterfaceCall),
        ];
        for (callees, relationship) in edges {
            for &callee in callees {
                self.link(registry, Some(callee), Some(Cause { parent, relationship }));
            }
        }

        for routine in compiled.inlined_routines.iter().copied().chain([parent]) {
            if !self.routines_with_inlining.insert(routine) {
                continue;
            }
            if let Some(parked) = self.anonymous_types.get(&routine).cloned() {
                for ty in parked {
                    self.account_for(registry, ty);
                }
            }
        }
    }

    fn needs_compilation(&self, registry: &RegistryImpl, settings: &ImageSettings, routine: RoutineId) -> bool {
        let def = registry.routine(routine);
        !def.flags.intersects(RoutineFlags::ABSTRACT | RoutineFlags::INTRINSIC)
            && !settings.policy.excludes(&registry.ty(def.holder).name)
            && !self.compiled.contains_key(&routine)
            && !self.in_flight.contains(&routine)
    }

    /// Runs gather and compile passes until a pass compiles nothing.
    /// Returns whether anything was compiled.
    pub fn compile(&mut self, ctx: &BuildContext) -> Result<bool, BuildError> {
        let mut compiled_any = false;
        loop {
            self.gather_new_types(ctx);
            if !self.compile_worklist(ctx)? {
                break;
            }
            compiled_any = true;
        }
        Ok(compiled_any)
    }

    /// Adds every foldable routine of every accounted-for type and
    /// compiles the result.
    pub fn compile_foldable_routines(&mut self, ctx: &BuildContext) -> Result<bool, BuildError> {
        {
            let registry = ctx.registry.read();
            let mut types: Vec<TypeId> = self.types.keys().copied().collect();
            types.sort();
            for ty in types {
                for &r in &registry.ty(ty).routines {
                    if registry.routine(r).flags.contains(RoutineFlags::FOLDABLE) {
                        self.link(&registry, Some(r), None);
                    }
                }
            }
        }
        self.compile(ctx)
    }

    /// Adds `name` as an entry point and compiles. A name that compiles
    /// nothing new only warrants a warning.
    pub fn compile_extra_entry_point(&mut self, ctx: &BuildContext, name: &str) -> Result<bool, BuildError> {
        self.add_entry_points_by_name(ctx, name)?;
        let compiled = self.compile(ctx)?;
        if !compiled {
            log::warn!("extra entry point {name} added no new compilations");
        }
        Ok(compiled)
    }

    fn drain_invalidations(&mut self, ctx: &BuildContext) {
        for routine in ctx.invalidations.take() {
            if self.in_flight.contains(&routine) {
                log::debug!("invalidated {routine:?} while compiling, result will be discarded");
                self.stale.insert(routine);
            } else if self.compiled.remove(&routine).is_some() {
                log::debug!("invalidated {routine:?}, recompiling");
                self.worklist.push_back(routine);
            } else {
                log::trace!("ignoring invalidation of uncompiled {routine:?}");
            }
        }
    }

    /// Compiles everything on the worklist. Returns whether anything was
    /// compiled.
    pub fn compile_worklist(&mut self, ctx: &BuildContext) -> Result<bool, BuildError> {
        if ctx.settings.compiler_threads <= 1 {
            return self.compile_serially(ctx);
        }

        let threads = ctx.settings.compiler_threads;
        let (job_tx, job_rx) = mpsc::sync_channel::<RoutineId>(threads * 2);
        let job_rx = Mutex::new(job_rx);
        let job_rx = &job_rx;
        // job_tx moves into the scope so every exit path closes the job
        // channel before the workers are joined
        thread::scope(move |s| {
            let (done_tx, done_rx) = mpsc::channel::<Completion>();
            for i in 0..threads {
                let done_tx = done_tx.clone();
                let compiler = &*ctx.compiler;
                let registry = &ctx.registry;
                thread::Builder::new()
                    .name(format!("imagegen-compile-{i}"))
                    .spawn_scoped(s, move || {
                        loop {
                            let Ok(routine) = job_rx.lock().recv() else {
                                break;
                            };
                            let result = compiler.compile(routine, registry);
                            if done_tx.send((routine, result)).is_err() {
                                break;
                            }
                        }
                    })?;
            }
            drop(done_tx);

            self.drive_pool(ctx, &job_tx, &done_rx)
        })
    }

    fn compile_serially(&mut self, ctx: &BuildContext) -> Result<bool, BuildError> {
        let start = self.total_compilations;
        loop {
            self.drain_invalidations(ctx);
            let Some(routine) = self.worklist.pop_front() else {
                break;
            };
            let needed = {
                let registry = ctx.registry.read();
                self.needs_compilation(&registry, &ctx.settings, routine)
            };
            if !needed {
                continue;
            }
            let result = ctx.compiler.compile(routine, &ctx.registry);
            self.complete(ctx, routine, result)?;
        }
        Ok(self.total_compilations > start)
    }

    // Only this thread touches the closure; workers see routine ids and
    // hand back results.
    fn drive_pool(
        &mut self,
        ctx: &BuildContext,
        jobs: &SyncSender<RoutineId>,
        done: &Receiver<Completion>,
    ) -> Result<bool, BuildError> {
        let start = self.total_compilations;
        let mut submitted = 0usize;
        let mut completed = 0usize;
        loop {
            loop {
                self.drain_invalidations(ctx);
                let Some(routine) = self.worklist.pop_front() else {
                    break;
                };
                let needed = {
                    let registry = ctx.registry.read();
                    self.needs_compilation(&registry, &ctx.settings, routine)
                };
                if !needed {
                    continue;
                }
                self.in_flight.insert(routine);
                submitted += 1;
                jobs.send(routine).map_err(|_| BuildError::PoolDisconnected)?;
            }

            if completed == submitted {
                if self.worklist.is_empty() && ctx.invalidations.is_empty() {
                    break;
                }
                continue;
            }

            let (routine, result) = done.recv().map_err(|_| BuildError::PoolDisconnected)?;
            completed += 1;
            self.drain_invalidations(ctx);
            self.in_flight.remove(&routine);
            if self.stale.remove(&routine) {
                self.worklist.push_back(routine);
                continue;
            }
            self.complete(ctx, routine, result)?;
        }
        Ok(self.total_compilations > start)
    }

    fn complete(
        &mut self,
        ctx: &BuildContext,
        routine: RoutineId,
        result: Result<CompiledRoutine, CompileError>,
    ) -> Result<(), BuildError> {
        let registry = ctx.registry.read();
        let compiled = match result {
            Ok(compiled) => compiled,
            Err(source) => {
                let chain = self.parent_chain(&registry, routine);
                log::error!("failed to compile {}\n{chain}", registry.qualified_name(routine));
                return Err(BuildError::Compilation {
                    routine: registry.qualified_name(routine),
                    source,
                    chain,
                });
            }
        };
        debug_assert_eq!(compiled.routine, routine);

        let compiled = Arc::new(compiled);
        self.compiled.insert(routine, Arc::clone(&compiled));
        self.fold(&registry, &compiled);
        self.total_compilations += 1;
        if self.total_compilations % PROGRESS_INTERVAL == 0 {
            log::debug!(
                "compiled {} routines, {} queued",
                self.total_compilations,
                self.worklist.len()
            );
        }
        Ok(())
    }

    pub fn parent_chain(&self, registry: &RegistryImpl, routine: RoutineId) -> ParentChain {
        let mut lines = vec![registry.qualified_name(routine)];
        let mut seen = AHashSet::new();
        seen.insert(routine);
        let mut current = routine;
        loop {
            match self.links.get(&current) {
                None => {
                    lines.push("which is not linked".to_owned());
                    break;
                }
                Some(Link { cause: None, .. }) => {
                    lines.push("which is a VM entry point".to_owned());
                    break;
                }
                Some(Link { cause: Some(cause), .. }) => {
                    lines.push(format!(
                        "which {} {}",
                        cause.relationship.as_child(),
                        registry.qualified_name(cause.parent)
                    ));
                    if !seen.insert(cause.parent) {
                        lines.push("which closes a cycle".to_owned());
                        break;
                    }
                    current = cause.parent;
                }
            }
        }
        ParentChain(lines)
    }

    pub fn link_of(&self, routine: RoutineId) -> Option<&Link> {
        self.links.get(&routine)
    }

    pub fn is_linked(&self, routine: RoutineId) -> bool {
        self.links.contains_key(&routine)
    }

    /// Every link, ordered by child.
    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self.links.values().copied().collect();
        links.sort_by_key(|l| l.child);
        links
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn compiled(&self, routine: RoutineId) -> Option<&Arc<CompiledRoutine>> {
        self.compiled.get(&routine)
    }

    /// Compiled routines, ordered by id.
    pub fn compiled_routines(&self) -> impl Iterator<Item = &Arc<CompiledRoutine>> {
        self.compiled.values()
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }

    pub fn type_info(&self, ty: TypeId) -> Option<&TypeClosureInfo> {
        self.types.get(&ty)
    }

    /// Types the closure has accounted for, ordered by id.
    pub fn accounted_types(&self) -> Vec<TypeId> {
        let mut types: Vec<TypeId> = self.types.keys().copied().collect();
        types.sort();
        types
    }

    pub fn worklist_len(&self) -> usize {
        self.worklist.len()
    }

    pub fn total_compilations(&self) -> usize {
        self.total_compilations
    }
}
