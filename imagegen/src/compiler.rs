use crate::{
    object::ObjectId,
    registry::{Registry, RoutineId},
};

/// Output of one compilation, plus everything the compiler discovered
/// the routine depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledRoutine {
    pub routine: RoutineId,
    pub code: Vec<u8>,
    /// Offset of the entry point within `code`.
    pub entry_offset: u32,
    pub scalar_literals: Vec<u8>,
    pub reference_literals: Vec<ObjectId>,
    pub direct_callees: Vec<RoutineId>,
    pub virtual_callees: Vec<RoutineId>,
    pub interface_callees: Vec<RoutineId>,
    pub literal_routines: Vec<RoutineId>,
    pub inlined_routines: Vec<RoutineId>,
}

impl CompiledRoutine {
    pub fn new(routine: RoutineId, code: Vec<u8>) -> Self {
        Self {
            routine,
            code,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Translates routines to target code. Implementations may load new
/// types into the registry while compiling.
pub trait Compiler: Send + Sync {
    fn compile(&self, routine: RoutineId, registry: &Registry) -> Result<CompiledRoutine, CompileError>;
}
