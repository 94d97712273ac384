use std::sync::Arc;

use ahash::AHashSet;
use bitflags::bitflags;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::object::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RoutineFlags: u8 {
        const ABSTRACT = 1 << 0;
        const STATIC = 1 << 1;
        /// Calls are folded at compile time; the invocation stub is linked eagerly.
        const FOLDABLE = 1 << 2;
        /// Never compiled, the compiler expands it in place.
        const INTRINSIC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Interface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItableEntry {
    pub interface: TypeId,
    /// First dispatch table slot of this interface's methods.
    pub start: usize,
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: Arc<str>,
    pub kind: TypeKind,
    pub super_type: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    /// Set for anonymous and local types.
    pub enclosing_routine: Option<RoutineId>,
    pub routines: Vec<RoutineId>,
    pub vtable: Vec<RoutineId>,
    pub itable: Vec<ItableEntry>,
    pub hub: Option<ObjectId>,
    pub dispatch_table: Option<ObjectId>,
}

impl TypeDef {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            super_type: None,
            interfaces: Vec::new(),
            enclosing_routine: None,
            routines: Vec::new(),
            vtable: Vec::new(),
            itable: Vec::new(),
            hub: None,
            dispatch_table: None,
        }
    }

    pub fn class(name: &str) -> Self {
        Self::new(name, TypeKind::Class)
    }

    pub fn interface(name: &str) -> Self {
        Self::new(name, TypeKind::Interface)
    }

    pub fn extends(mut self, super_type: TypeId) -> Self {
        self.super_type = Some(super_type);
        self
    }

    pub fn implements(mut self, interface: TypeId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn enclosed_by(mut self, routine: RoutineId) -> Self {
        self.enclosing_routine = Some(routine);
        self
    }

    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }
}

#[derive(Debug, Clone)]
pub struct RoutineDef {
    pub holder: TypeId,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub flags: RoutineFlags,
    /// Type whose local virtual routines implement the reflective
    /// invocation stub of this routine.
    pub invocation_stub: Option<TypeId>,
}

impl RoutineDef {
    pub fn new(holder: TypeId, name: &str, descriptor: &str) -> Self {
        Self {
            holder,
            name: name.into(),
            descriptor: descriptor.into(),
            flags: RoutineFlags::empty(),
            invocation_stub: None,
        }
    }

    pub fn with_flags(mut self, flags: RoutineFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_invocation_stub(mut self, stub: TypeId) -> Self {
        self.invocation_stub = Some(stub);
        self
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(RoutineFlags::STATIC)
    }

    fn same_signature(&self, name: &str, descriptor: &str) -> bool {
        &*self.name == name && &*self.descriptor == descriptor
    }
}

/// Every type and routine the image generator knows about. Compiler
/// threads may load new types while the closure reads it, so it lives
/// behind a shared lock.
#[derive(Debug, Clone, Default)]
pub struct Registry(Arc<RwLock<RegistryImpl>>);

#[derive(Debug, Default)]
pub struct RegistryImpl {
    types: Vec<TypeDef>,
    routines: Vec<RoutineDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RegistryImpl> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RegistryImpl> {
        self.0.write()
    }
}

impl RegistryImpl {
    pub fn load_type(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(def);
        id
    }

    pub fn add_routine(&mut self, def: RoutineDef) -> RoutineId {
        let id = RoutineId(self.routines.len() as u32);
        let holder = def.holder;
        self.routines.push(def);
        self.types[holder.0 as usize].routines.push(id);
        id
    }

    pub fn ty(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn ty_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.0 as usize]
    }

    pub fn routine(&self, id: RoutineId) -> &RoutineDef {
        &self.routines[id.0 as usize]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn routine_count(&self) -> usize {
        self.routines.len()
    }

    pub fn loaded_types(&self) -> impl Iterator<Item = TypeId> + '_ {
        (0..self.types.len() as u32).map(TypeId)
    }

    pub fn qualified_name(&self, id: RoutineId) -> String {
        let def = self.routine(id);
        format!("{}.{}{}", self.ty(def.holder).name, def.name, def.descriptor)
    }

    /// Proper supertypes, nearest first.
    pub fn all_super_types(&self, id: TypeId) -> Vec<TypeId> {
        let mut chain = Vec::new();
        let mut current = self.ty(id).super_type;
        while let Some(t) = current {
            chain.push(t);
            current = self.ty(t).super_type;
        }
        chain
    }

    /// Every interface `id` implements, directly or through its supertypes
    /// and superinterfaces, in discovery order.
    pub fn all_interfaces(&self, id: TypeId) -> Vec<TypeId> {
        let mut seen = AHashSet::new();
        let mut out = Vec::new();
        let mut pending: Vec<TypeId> = Vec::new();
        for t in std::iter::once(id).chain(self.all_super_types(id)) {
            pending.extend(self.ty(t).interfaces.iter().rev());
            while let Some(i) = pending.pop() {
                if !seen.insert(i) {
                    continue;
                }
                out.push(i);
                pending.extend(self.ty(i).interfaces.iter().rev());
            }
        }
        out
    }

    pub fn is_subtype_of(&self, sub: TypeId, sup: TypeId) -> bool {
        sub == sup
            || self.all_super_types(sub).contains(&sup)
            || self.all_interfaces(sub).contains(&sup)
    }

    pub fn all_subtypes(&self, id: TypeId) -> Vec<TypeId> {
        self.loaded_types()
            .filter(|&t| t != id && self.all_super_types(t).contains(&id))
            .collect()
    }

    pub fn all_interface_implementors(&self, interface: TypeId) -> Vec<TypeId> {
        self.loaded_types()
            .filter(|&t| !self.ty(t).is_interface())
            .filter(|&t| self.all_interfaces(t).contains(&interface))
            .collect()
    }

    pub fn local_virtual_routines(&self, id: TypeId) -> Vec<RoutineId> {
        self.ty(id)
            .routines
            .iter()
            .copied()
            .filter(|&r| !self.routine(r).is_static())
            .collect()
    }

    pub fn local_static_routines(&self, id: TypeId) -> Vec<RoutineId> {
        self.ty(id)
            .routines
            .iter()
            .copied()
            .filter(|&r| self.routine(r).is_static())
            .collect()
    }

    /// Methods an interface declares, in itable order.
    pub fn interface_methods(&self, interface: TypeId) -> Vec<RoutineId> {
        self.local_virtual_routines(interface)
    }

    /// Vtable slot of `routine` in `id`, matching by signature so an
    /// inherited slot is found through its override.
    pub fn virtual_slot(&self, id: TypeId, routine: RoutineId) -> Option<usize> {
        let def = self.routine(routine);
        self.ty(id)
            .vtable
            .iter()
            .position(|&v| self.routine(v).same_signature(&def.name, &def.descriptor))
    }

    /// Resolves a virtual call of `name descriptor` on a receiver of
    /// type `id`, searching upwards from `id`.
    pub fn find_virtual(
        &self,
        id: TypeId,
        name: &str,
        descriptor: &str,
    ) -> Option<RoutineId> {
        std::iter::once(id)
            .chain(self.all_super_types(id))
            .find_map(|t| {
                self.ty(t).routines.iter().copied().find(|&r| {
                    let def = self.routine(r);
                    !def.is_static() && def.same_signature(name, descriptor)
                })
            })
    }

    /// Resolves `Holder.name` or `Holder.*` to routines declared by
    /// `Holder`. Returns `None` if no loaded type has that name.
    pub fn find_by_qualified_name(&self, qualified: &str) -> Option<Vec<RoutineId>> {
        let (holder, name) = qualified.rsplit_once('.')?;
        let ty = self.loaded_types().find(|&t| &*self.ty(t).name == holder)?;
        Some(
            self.ty(ty)
                .routines
                .iter()
                .copied()
                .filter(|&r| name == "*" || &*self.routine(r).name == name)
                .collect(),
        )
    }

    /// Builds the vtable and itable layout of a class from its supertype,
    /// its own virtual routines and its interfaces.
    pub fn assign_dispatch_slots(&mut self, id: TypeId) {
        if self.ty(id).is_interface() {
            return;
        }
        let mut vtable = match self.ty(id).super_type {
            Some(s) => self.ty(s).vtable.clone(),
            None => Vec::new(),
        };
        for r in self.local_virtual_routines(id) {
            let def = self.routine(r);
            let overridden = vtable.iter().position(|&v| {
                self.routine(v).same_signature(&def.name, &def.descriptor)
            });
            match overridden {
                Some(slot) => vtable[slot] = r,
                None => vtable.push(r),
            }
        }
        let mut next = vtable.len();
        let mut itable = Vec::new();
        for interface in self.all_interfaces(id) {
            itable.push(ItableEntry {
                interface,
                start: next,
            });
            next += self.interface_methods(interface).len();
        }
        let def = self.ty_mut(id);
        def.vtable = vtable;
        def.itable = itable;
    }

    /// Number of words the dispatch table of `id` needs.
    pub fn dispatch_table_length(&self, id: TypeId) -> usize {
        let def = self.ty(id);
        def.itable
            .last()
            .map(|e| e.start + self.interface_methods(e.interface).len())
            .unwrap_or(def.vtable.len())
    }
}
