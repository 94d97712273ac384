mod builder;
mod cells;
mod closure;
mod compiler;
mod image;
mod layout;
mod linker;
mod object;
mod placement;
mod registry;
mod relocation;
mod report;
mod settings;

pub use builder::{BuildContext, BuildStats, BuiltImage, FieldRef, ImageAnchors, ImageBuilder, ReportPaths};
pub use cells::{Cell, CellKey, CellMap, DEBUG_TAG, LinearRegion, RegionKind, Synthetic};
pub use closure::{BuildError, Cause, Closure, InvalidationQueue, Link, ParentChain, Relationship, TypeClosureInfo};
pub use compiler::{CompileError, CompiledRoutine, Compiler};
pub use image::{
    BUILD_LEVELS, BootImage, FORMAT_VERSION, FieldDesc, FormatError, Header, IDENTIFICATION, ISAS, IntSection,
    OPERATING_SYSTEMS, StringInfo, Trailer,
};
pub use layout::{CellVisitor, CodeBundle, CodePart, LayoutError, ObjectLayout};
pub use linker::{DispatchPatches, SlotOutOfRange, link_dispatch_tables};
pub use object::{Field, HeapObject, LiveObjects, ObjectBody, ObjectGraph, ObjectId, Value, WellKnownHubs};
pub use placement::{Placed, Placement, PlacementError};
pub use registry::{ItableEntry, Registry, RegistryImpl, RoutineDef, RoutineFlags, RoutineId, TypeDef, TypeId, TypeKind};
pub use relocation::{PointerScope, WordBitmap, pointer_offsets};
pub use report::{save as save_report, write_link_report, write_region_map};
pub use settings::{
    BuildLevel, CompilationPolicy, DataModel, Endianness, ImageCreateInfo, ImageSettings, KB, TLA_SLOT_COUNT,
    TlaLayout, align_up,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0} names a routine or object that was not placed")]
    Unplaced(&'static str),
    #[error("{field} value {value:#x} does not fit a header field")]
    HeaderOverflow { field: &'static str, value: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
