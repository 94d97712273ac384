mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Condvar, Mutex};

use common::{ScriptedCompiler, Universe};
use imagegen::{
    BuildContext, BuildError, CompileError, CompiledRoutine, Compiler, Error, HeapObject, ImageBuilder,
    ImageCreateInfo, InvalidationQueue, Registry, Relationship, RoutineDef, RoutineFlags, RoutineId, TypeDef,
    align_up,
};

fn threads(n: usize) -> ImageCreateInfo {
    ImageCreateInfo {
        compiler_threads: Some(n),
        serializer_threads: Some(n),
        ..Default::default()
    }
}

#[test]
fn minimal_closure_holds_only_the_root() {
    let u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    u.routine(main_class, "unused");

    let compiler = Arc::new(ScriptedCompiler::new());
    let mut builder = u.builder(compiler.clone(), threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    let closure = builder.closure();
    assert_eq!(closure.links().iter().map(|l| l.child).collect::<Vec<_>>(), vec![main]);
    assert_eq!(closure.compiled_count(), 1);

    let built = builder.build(&u.graph).unwrap();
    // one 16-byte routine behind a 3-word array header
    let code_cell = align_up(24 + 16, 8);
    assert_eq!(built.image.header.code_size as u64, align_up(code_cell, 4096));
    assert_eq!(built.image.header.heap_size, 4096);
    // only the well-known hubs are live
    assert_eq!(built.stats.live_objects, 4);
    assert_eq!(built.stats.code_cells, 1);
}

#[test]
fn reference_literals_are_placed_in_the_heap() {
    let mut u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    let greeting = u.graph.add(HeapObject::bytes(u.graph.hubs.byte_array, b"hello".to_vec()));

    let compiler = Arc::new(ScriptedCompiler::new());
    compiler.output(CompiledRoutine {
        reference_literals: vec![greeting],
        scalar_literals: vec![1, 2, 3, 4],
        ..CompiledRoutine::new(main, vec![0x90; 8])
    });
    let mut builder = u.builder(compiler, threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();
    let built = builder.build(&u.graph).unwrap();

    assert_eq!(built.stats.live_objects, 5);
    assert_eq!(built.stats.code_cells, 3);
}

#[test]
fn converged_closure_is_idempotent() {
    let u = Universe::new();
    let c = u.class("app.Main");
    let [main, a, b] = ["main", "a", "b"].map(|n| u.routine(c, n));
    let compiler = Arc::new(ScriptedCompiler::new());
    compiler.output(CompiledRoutine {
        direct_callees: vec![a, b],
        ..CompiledRoutine::new(main, vec![1])
    });
    compiler.output(CompiledRoutine {
        direct_callees: vec![main],
        ..CompiledRoutine::new(b, vec![2])
    });

    let mut builder = u.builder(compiler.clone(), threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();
    let links = builder.closure().links();
    let calls = compiler.calls();
    assert_eq!(links.len(), 3);
    assert_eq!(calls, 3);

    builder.compile(&[]).unwrap();
    assert_eq!(builder.closure().links(), links);
    assert_eq!(compiler.calls(), calls);
}

fn virtual_dispatch_discovery(compiler_threads: usize) {
    let u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    let shape = u.class("app.Shape");
    let shape_area = u.routine(shape, "area");

    let compiler = Arc::new(ScriptedCompiler::new());
    compiler.output(CompiledRoutine {
        virtual_callees: vec![shape_area],
        ..CompiledRoutine::new(main, vec![1])
    });
    // the subclass only becomes known while main is being compiled
    compiler.on_compile(main, move |registry| {
        let mut reg = registry.write();
        let circle = reg.load_type(TypeDef::class("app.Circle").extends(shape));
        reg.add_routine(RoutineDef::new(circle, "area", "()V"));
    });

    let mut builder = u.builder(compiler, threads(compiler_threads));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    let registry = u.registry.read();
    let circle_area = registry.find_by_qualified_name("app.Circle.area").unwrap()[0];
    let closure = builder.closure();
    let link = closure.link_of(circle_area).unwrap();
    assert_eq!(link.relationship(), Some(Relationship::Overrides));
    assert_eq!(link.parent(), Some(shape_area));
    assert!(closure.compiled(circle_area).is_some());
    assert!(closure.compiled(shape_area).is_some());
    assert_eq!(
        closure.parent_chain(&registry, circle_area).lines(),
        [
            "app.Circle.area()V",
            "which overrides app.Shape.area()V",
            "which is virtually called by app.Main.main()V",
            "which is a VM entry point",
        ]
    );
}

#[test]
fn late_subclass_override_is_linked() {
    virtual_dispatch_discovery(1);
}

#[test]
fn late_subclass_override_is_linked_by_the_pool() {
    virtual_dispatch_discovery(4);
}

#[test]
fn interface_calls_reach_implementors() {
    let u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    let (runnable_run, task_run) = {
        let mut reg = u.registry.write();
        let runnable = reg.load_type(TypeDef::interface("app.Runnable"));
        let task = reg.load_type(TypeDef::class("app.Task").extends(u.object).implements(runnable));
        (
            reg.add_routine(RoutineDef::new(runnable, "run", "()V")),
            reg.add_routine(RoutineDef::new(task, "run", "()V")),
        )
    };
    let compiler = Arc::new(ScriptedCompiler::new());
    compiler.output(CompiledRoutine {
        interface_callees: vec![runnable_run],
        ..CompiledRoutine::new(main, vec![1])
    });

    let mut builder = u.builder(compiler, threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    let link = builder.closure().link_of(task_run).unwrap();
    assert_eq!(link.relationship(), Some(Relationship::Implements));
    assert!(builder.closure().compiled(task_run).is_some());
}

fn invalidation_recompiles(compiler_threads: usize) {
    let u = Universe::new();
    let c = u.class("app.Main");
    let [main, a, b] = ["main", "a", "b"].map(|n| u.routine(c, n));
    let compiler = Arc::new(ScriptedCompiler::new());
    compiler.output(CompiledRoutine {
        direct_callees: vec![a, b],
        ..CompiledRoutine::new(main, vec![1])
    });

    let mut builder = u.builder(compiler.clone(), threads(compiler_threads));
    // compiling b breaks an assumption a was compiled under
    let invalidations = builder.context().invalidations.clone();
    compiler.on_compile(b, move |_| invalidations.invalidate(a));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    assert_eq!(compiler.calls(), 4);
    assert!(builder.closure().compiled(a).is_some());
    assert!(builder.context().invalidations.is_empty());
}

#[test]
fn invalidated_routine_is_recompiled() {
    invalidation_recompiles(1);
}

#[test]
fn invalidation_during_pool_compile_is_not_lost() {
    invalidation_recompiles(3);
}

/// The first compile of `held` waits until compiling `releaser` has
/// invalidated it, so the invalidation always lands while `held` is in
/// flight.
struct GatedCompiler {
    main: RoutineId,
    held: RoutineId,
    releaser: RoutineId,
    invalidations: InvalidationQueue,
    open: Mutex<bool>,
    opened: Condvar,
    held_compiles: AtomicUsize,
    calls: AtomicUsize,
}

impl Compiler for GatedCompiler {
    fn compile(&self, routine: RoutineId, _: &Registry) -> Result<CompiledRoutine, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if routine == self.main {
            return Ok(CompiledRoutine {
                direct_callees: vec![self.held, self.releaser],
                ..CompiledRoutine::new(routine, vec![1])
            });
        }
        if routine == self.held {
            if self.held_compiles.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(CompiledRoutine::new(routine, vec![0xBB]));
            }
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
            return Ok(CompiledRoutine::new(routine, vec![0xAA]));
        }
        if routine == self.releaser {
            self.invalidations.invalidate(self.held);
            *self.open.lock() = true;
            self.opened.notify_all();
        }
        Ok(CompiledRoutine::new(routine, vec![0xC3]))
    }
}

#[test]
fn result_of_a_compile_invalidated_in_flight_is_discarded() {
    let u = Universe::new();
    let c = u.class("app.Main");
    let [main, a, b] = ["main", "a", "b"].map(|n| u.routine(c, n));
    let invalidations = InvalidationQueue::default();
    let compiler = Arc::new(GatedCompiler {
        main,
        held: a,
        releaser: b,
        invalidations: invalidations.clone(),
        open: Mutex::new(false),
        opened: Condvar::new(),
        held_compiles: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let mut ctx = BuildContext::new(common::settings(threads(3)), u.registry.clone(), compiler.clone());
    ctx.invalidations = invalidations;
    let mut builder = ImageBuilder::new(ctx);
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    assert_eq!(compiler.calls.load(Ordering::SeqCst), 4);
    assert_eq!(compiler.held_compiles.load(Ordering::SeqCst), 2);
    let closure = builder.closure();
    assert_eq!(closure.compiled(a).unwrap().code, [0xBB]);
    // the discarded result is not counted
    assert_eq!(closure.total_compilations(), 3);
    assert!(builder.context().invalidations.is_empty());
}

#[test]
fn uncalled_foldable_routines_are_still_compiled() {
    let u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    let constants = u.class("app.Constants");
    let (answer, plain) = {
        let mut reg = u.registry.write();
        (
            reg.add_routine(RoutineDef::new(constants, "answer", "()I").with_flags(RoutineFlags::FOLDABLE)),
            reg.add_routine(RoutineDef::new(constants, "plain", "()I")),
        )
    };

    let compiler = Arc::new(ScriptedCompiler::new());
    let mut builder = u.builder(compiler.clone(), threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();

    let closure = builder.closure();
    assert!(closure.compiled(answer).is_some());
    assert_eq!(closure.link_of(answer).unwrap().cause, None);
    assert!(closure.link_of(plain).is_none());
    assert_eq!(compiler.calls(), 2);
}

#[test]
fn invocation_stub_routines_become_entry_points() {
    let u = Universe::new();
    let main_class = u.class("app.Main");
    let stub = u.class("app.Main$Invoker");
    let (call, invoke, invoke_exact, create) = {
        let mut reg = u.registry.write();
        (
            reg.add_routine(RoutineDef::new(main_class, "call", "()V").with_invocation_stub(stub)),
            reg.add_routine(RoutineDef::new(stub, "invoke", "()V")),
            reg.add_routine(RoutineDef::new(stub, "invokeExact", "()V")),
            reg.add_routine(RoutineDef::new(stub, "create", "()V").with_flags(RoutineFlags::STATIC)),
        )
    };

    let compiler = Arc::new(ScriptedCompiler::new());
    let mut builder = u.builder(compiler, threads(1));
    assert!(builder.add_invocation_stub(call));
    assert!(!builder.add_invocation_stub(call));
    // no stub, nothing to add
    assert!(!builder.add_invocation_stub(create));
    builder.compile(&[]).unwrap();

    let closure = builder.closure();
    for routine in [invoke, invoke_exact] {
        assert_eq!(closure.link_of(routine).unwrap().cause, None);
        assert!(closure.compiled(routine).is_some());
    }
    assert!(closure.link_of(call).is_none());
    assert!(closure.link_of(create).is_none());
}

#[test]
fn extra_entry_points_resolve_by_name() {
    let u = Universe::new();
    let util = u.class("app.Util");
    let [x, y] = ["x", "y"].map(|n| u.routine(util, n));
    let compiler = Arc::new(ScriptedCompiler::new());
    let mut builder = u.builder(compiler, threads(1));
    builder.compile(&["app.Util.*"]).unwrap();
    assert!(builder.closure().compiled(x).is_some());
    assert!(builder.closure().compiled(y).is_some());

    // already compiled, only warns
    builder.compile(&["app.Util.x"]).unwrap();

    assert!(matches!(
        builder.compile(&["app.Missing.run"]),
        Err(Error::Build(BuildError::UnknownEntryPoint(name))) if name == "app.Missing.run"
    ));
}

#[test]
fn dispatch_tables_point_into_code() {
    let mut u = Universe::new();
    let main_class = u.class("app.Main");
    let main = u.routine(main_class, "main");
    u.materialize(main_class);
    let compiler = Arc::new(ScriptedCompiler::new());
    let mut builder = u.builder(compiler, threads(1));
    builder.add_entry_point(main);
    builder.compile(&[]).unwrap();
    let built = builder.build(&u.graph).unwrap();

    let image = &built.image;
    let memory = image.relocate(0);
    let map = image.relocation_map();
    // hub, table and four well-known hubs are all live
    assert_eq!(built.stats.live_objects, 6);
    let code_start = image.header.heap_size as u64;
    let relocated_into_code = map
        .marked_words()
        .map(|w| w * 8)
        .filter(|&at| (at as usize) < image.heap.len())
        .map(|at| u64::from_le_bytes(memory[at as usize..at as usize + 8].try_into().unwrap()))
        .filter(|&value| value >= code_start)
        .count();
    // the single vtable slot of main
    assert_eq!(relocated_into_code, 1);
}
