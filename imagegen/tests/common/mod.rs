#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::Mutex;

use imagegen::{
    BuildContext, CompileError, CompiledRoutine, Compiler, HeapObject, ImageBuilder, ImageCreateInfo, ImageSettings,
    ObjectGraph, ObjectId, Registry, RegistryImpl, RoutineDef, RoutineId, TypeDef, TypeId, WellKnownHubs,
};

type Hook = Box<dyn Fn(&Registry) + Send + Sync>;

/// Compiler that returns canned results and can load types as a side
/// effect, the way a real compiler resolves classes while it works.
#[derive(Default)]
pub struct ScriptedCompiler {
    outputs: Mutex<AHashMap<RoutineId, CompiledRoutine>>,
    hooks: Mutex<AHashMap<RoutineId, Hook>>,
    calls: AtomicUsize,
}

impl ScriptedCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self, compiled: CompiledRoutine) {
        self.outputs.lock().insert(compiled.routine, compiled);
    }

    /// Runs `hook` once, the first time `routine` is compiled.
    pub fn on_compile(&self, routine: RoutineId, hook: impl Fn(&Registry) + Send + Sync + 'static) {
        self.hooks.lock().insert(routine, Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for ScriptedCompiler {
    fn compile(&self, routine: RoutineId, registry: &Registry) -> Result<CompiledRoutine, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.hooks.lock().remove(&routine);
        if let Some(hook) = hook {
            hook(registry);
        }
        Ok(self
            .outputs
            .lock()
            .get(&routine)
            .cloned()
            .unwrap_or_else(|| CompiledRoutine::new(routine, vec![0xC3; 16])))
    }
}

/// A root class with hubs for every array kind.
pub struct Universe {
    pub registry: Registry,
    pub graph: ObjectGraph,
    pub object: TypeId,
}

impl Universe {
    pub fn new() -> Self {
        let registry = Registry::new();
        let object = registry.write().load_type(TypeDef::class("java.lang.Object"));
        let mut graph = ObjectGraph::new();
        let object_hub = graph.add(HeapObject::tuple(None, 16, vec![]));
        let [byte_array, reference_array, word_array] =
            [(); 3].map(|_| graph.add(HeapObject::tuple(Some(object_hub), 16, vec![])));
        graph.hubs = WellKnownHubs {
            object: Some(object_hub),
            byte_array: Some(byte_array),
            reference_array: Some(reference_array),
            word_array: Some(word_array),
        };
        registry.write().ty_mut(object).hub = Some(object_hub);
        Self {
            registry,
            graph,
            object,
        }
    }

    pub fn class(&self, name: &str) -> TypeId {
        self.registry.write().load_type(TypeDef::class(name).extends(self.object))
    }

    pub fn routine(&self, holder: TypeId, name: &str) -> RoutineId {
        self.registry.write().add_routine(RoutineDef::new(holder, name, "()V"))
    }

    /// Gives `ty` a hub and a dispatch table sized for its slots.
    pub fn materialize(&mut self, ty: TypeId) -> (ObjectId, ObjectId) {
        let mut reg = self.registry.write();
        reg.assign_dispatch_slots(ty);
        let length = reg.dispatch_table_length(ty);
        let hub = self.graph.add(HeapObject::tuple(self.graph.hubs.object, 24, vec![]));
        let table = self
            .graph
            .add(HeapObject::words(self.graph.hubs.word_array, vec![0; length]));
        let def = reg.ty_mut(ty);
        def.hub = Some(hub);
        def.dispatch_table = Some(table);
        (hub, table)
    }

    pub fn builder(&self, compiler: Arc<ScriptedCompiler>, info: ImageCreateInfo) -> ImageBuilder {
        ImageBuilder::new(BuildContext::new(settings(info), self.registry.clone(), compiler))
    }
}

/// Settings with a fixed random id and host-independent ISA and OS.
pub fn settings(info: ImageCreateInfo) -> ImageSettings {
    ImageCreateInfo {
        random_id: info.random_id.or(Some(0x5EED)),
        isa: info.isa.clone().or(Some("AMD64".into())),
        os: info.os.clone().or(Some("LINUX".into())),
        ..info
    }
    .into()
}

pub fn qualified(registry: &RegistryImpl, routines: impl IntoIterator<Item = RoutineId>) -> Vec<String> {
    routines.into_iter().map(|r| registry.qualified_name(r)).collect()
}
