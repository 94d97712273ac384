use std::collections::BTreeMap;

use crate::{
    object::{ObjectBody, ObjectGraph, ObjectId},
    registry::{RegistryImpl, RoutineId, TypeId},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dispatch slot {slot} of {type_name} is outside its {length}-entry table")]
pub struct SlotOutOfRange {
    pub type_name: String,
    pub slot: usize,
    pub length: usize,
}

/// Code addresses written over dispatch table slots, keyed by table
/// object and slot index.
#[derive(Debug, Default, Clone)]
pub struct DispatchPatches {
    slots: BTreeMap<(ObjectId, usize), u64>,
}

impl DispatchPatches {
    pub fn get(&self, table: ObjectId, slot: usize) -> Option<u64> {
        self.slots.get(&(table, slot)).copied()
    }

    pub fn insert(&mut self, table: ObjectId, slot: usize, address: u64) {
        self.slots.insert((table, slot), address);
    }

    /// Follows the code region when it is moved.
    pub fn shift(&mut self, delta: u64) {
        for address in self.slots.values_mut() {
            *address += delta;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, usize, u64)> + '_ {
        self.slots.iter().map(|(&(t, s), &a)| (t, s, a))
    }
}

/// Patches vtable and itable slots of `types` with the entry address of
/// the routine's compiled form. Slots without compiled code are left
/// alone and resolved lazily at run time.
pub fn link_dispatch_tables(
    registry: &RegistryImpl,
    graph: &ObjectGraph,
    types: &[TypeId],
    entry_of: impl Fn(RoutineId) -> Option<u64>,
) -> Result<DispatchPatches, SlotOutOfRange> {
    let mut patches = DispatchPatches::default();
    for &ty in types {
        let def = registry.ty(ty);
        let Some(table) = def.dispatch_table else {
            continue;
        };
        let length = match &graph.get(table).body {
            ObjectBody::WordArray(words) => words.len(),
            _ => 0,
        };
        let mut patch = |slot: usize, routine: Option<RoutineId>| {
            if slot >= length {
                return Err(SlotOutOfRange {
                    type_name: def.name.to_string(),
                    slot,
                    length,
                });
            }
            if let Some(address) = routine.and_then(&entry_of) {
                patches.insert(table, slot, address);
            }
            Ok(())
        };

        for (slot, &routine) in def.vtable.iter().enumerate() {
            patch(slot, Some(routine))?;
        }
        for entry in &def.itable {
            for (index, method) in registry.interface_methods(entry.interface).into_iter().enumerate() {
                let method = registry.routine(method);
                let target = registry.find_virtual(ty, &method.name, &method.descriptor);
                patch(entry.start + index, target)?;
            }
        }
    }
    log::debug!("patched {} dispatch slots", patches.len());
    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        object::HeapObject,
        registry::{RoutineDef, TypeDef},
    };

    #[test]
    fn vtable_and_itable_slots_get_entry_addresses() {
        let mut graph = ObjectGraph::new();
        let mut reg = RegistryImpl::default();
        let runnable = reg.load_type(TypeDef::interface("Runnable"));
        let task = reg.load_type(TypeDef::class("Task").implements(runnable));
        reg.add_routine(RoutineDef::new(runnable, "run", "()V"));
        let run = reg.add_routine(RoutineDef::new(task, "run", "()V"));
        reg.add_routine(RoutineDef::new(task, "cancel", "()V"));
        reg.assign_dispatch_slots(task);
        let table = graph.add(HeapObject::words(None, vec![0; reg.dispatch_table_length(task)]));
        reg.ty_mut(task).dispatch_table = Some(table);

        let patches = link_dispatch_tables(&reg, &graph, &[runnable, task], |r| {
            (r == run).then_some(0x1000)
        })
        .unwrap();
        assert_eq!(patches.get(table, 0), Some(0x1000));
        // cancel has no compiled form
        assert_eq!(patches.get(table, 1), None);
        assert_eq!(patches.get(table, 2), Some(0x1000));
        assert_eq!(patches.len(), 2);
    }

    #[test]
    fn short_table_is_rejected() {
        let mut graph = ObjectGraph::new();
        let mut reg = RegistryImpl::default();
        let t = reg.load_type(TypeDef::class("T"));
        reg.add_routine(RoutineDef::new(t, "m", "()V"));
        reg.assign_dispatch_slots(t);
        let table = graph.add(HeapObject::words(None, vec![]));
        reg.ty_mut(t).dispatch_table = Some(table);

        let err = link_dispatch_tables(&reg, &graph, &[t], |_| Some(8)).unwrap_err();
        assert_eq!(err.slot, 0);
        assert_eq!(err.length, 0);
    }

    #[test]
    fn shift_moves_every_patch() {
        let mut patches = DispatchPatches::default();
        patches.insert(ObjectId(3), 0, 0x10);
        patches.insert(ObjectId(3), 1, 0x20);
        patches.shift(0x1000);
        assert_eq!(
            patches.iter().collect::<Vec<_>>(),
            vec![(ObjectId(3), 0, 0x1010), (ObjectId(3), 1, 0x1020)]
        );
    }
}
