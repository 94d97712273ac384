use std::collections::VecDeque;

use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Word(u64),
    Reference(Option<ObjectId>),
}

impl Value {
    pub const NULL: Value = Value::Reference(None);

    pub fn width(&self, word_size: usize) -> usize {
        match self {
            Value::I8(_) => 1,
            Value::I16(_) => 2,
            Value::I32(_) | Value::F32(_) => 4,
            Value::I64(_) | Value::F64(_) => 8,
            Value::Word(_) | Value::Reference(_) => word_size,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Reference(_))
    }

    /// Raw bits for every non-reference value.
    pub fn bits(&self) -> u64 {
        match *self {
            Value::I8(v) => v as u8 as u64,
            Value::I16(v) => v as u16 as u64,
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
            Value::Word(v) => v,
            Value::Reference(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Byte offset from the start of the cell, header included.
    pub offset: u32,
    pub value: Value,
    /// Weak referents are written as null and never relocated.
    pub relocation_exempt: bool,
}

impl Field {
    pub fn new(offset: u32, value: Value) -> Self {
        Self {
            offset,
            value,
            relocation_exempt: false,
        }
    }

    pub fn exempt(offset: u32, value: Value) -> Self {
        Self {
            offset,
            value,
            relocation_exempt: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBody {
    Tuple { size: u32, fields: Vec<Field> },
    ReferenceArray(Vec<Option<ObjectId>>),
    ByteArray(Vec<u8>),
    WordArray(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    pub hub: Option<ObjectId>,
    pub body: ObjectBody,
    /// Objects whose reference fields may be written at run time are
    /// placed in the mutable prefix of the heap.
    pub mutable_references: bool,
}

impl HeapObject {
    pub fn tuple(hub: Option<ObjectId>, size: u32, fields: Vec<Field>) -> Self {
        Self {
            hub,
            body: ObjectBody::Tuple { size, fields },
            mutable_references: false,
        }
    }

    pub fn references(hub: Option<ObjectId>, elements: Vec<Option<ObjectId>>) -> Self {
        Self {
            hub,
            body: ObjectBody::ReferenceArray(elements),
            mutable_references: false,
        }
    }

    pub fn bytes(hub: Option<ObjectId>, bytes: Vec<u8>) -> Self {
        Self {
            hub,
            body: ObjectBody::ByteArray(bytes),
            mutable_references: false,
        }
    }

    pub fn words(hub: Option<ObjectId>, words: Vec<u64>) -> Self {
        Self {
            hub,
            body: ObjectBody::WordArray(words),
            mutable_references: false,
        }
    }

    pub fn mutable(mut self) -> Self {
        self.mutable_references = true;
        self
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.body, ObjectBody::Tuple { .. })
    }

    /// Hub first, then outgoing references in layout order.
    pub fn outgoing(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let body: Box<dyn Iterator<Item = ObjectId> + '_> = match &self.body {
            ObjectBody::Tuple { fields, .. } => Box::new(fields.iter().filter_map(|f| match f {
                Field {
                    value: Value::Reference(r),
                    relocation_exempt: false,
                    ..
                } => *r,
                _ => None,
            })),
            ObjectBody::ReferenceArray(elements) => Box::new(elements.iter().flatten().copied()),
            ObjectBody::ByteArray(_) | ObjectBody::WordArray(_) => Box::new(std::iter::empty()),
        };
        self.hub.into_iter().chain(body)
    }
}

/// Hubs the image generator needs for the objects it synthesizes itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnownHubs {
    pub object: Option<ObjectId>,
    pub byte_array: Option<ObjectId>,
    pub reference_array: Option<ObjectId>,
    pub word_array: Option<ObjectId>,
}

/// The prototype heap: every host object that may end up in the image.
#[derive(Debug, Default)]
pub struct ObjectGraph {
    objects: Vec<HeapObject>,
    pub hubs: WellKnownHubs,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: HeapObject) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    pub fn get(&self, id: ObjectId) -> &HeapObject {
        &self.objects[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut HeapObject {
        &mut self.objects[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrites the tuple field at `offset`, adding it if absent.
    pub fn set_field(&mut self, id: ObjectId, offset: u32, value: Value) {
        if let ObjectBody::Tuple { fields, .. } = &mut self.get_mut(id).body {
            match fields.iter_mut().find(|f| f.offset == offset) {
                Some(field) => field.value = value,
                None => fields.push(Field::new(offset, value)),
            }
        }
    }
}

/// Objects reachable from the image roots, in discovery order.
#[derive(Debug, Default)]
pub struct LiveObjects {
    order: Vec<ObjectId>,
    parents: AHashMap<ObjectId, Option<ObjectId>>,
}

impl LiveObjects {
    pub fn gather(graph: &ObjectGraph, roots: impl IntoIterator<Item = ObjectId>) -> Self {
        let mut live = LiveObjects::default();
        let mut queue = VecDeque::new();
        for root in roots {
            if live.parents.contains_key(&root) {
                continue;
            }
            live.parents.insert(root, None);
            queue.push_back(root);
        }
        while let Some(id) = queue.pop_front() {
            live.order.push(id);
            for child in graph.get(id).outgoing() {
                if live.parents.contains_key(&child) {
                    continue;
                }
                live.parents.insert(child, Some(id));
                queue.push_back(child);
            }
        }
        log::debug!("gathered {} live objects", live.order.len());
        live
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.parents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.order.iter().copied()
    }

    /// Reference path from a root down to `id`.
    pub fn path_to(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(Some(parent)) = self.parents.get(&current) {
            path.push(*parent);
            current = *parent;
        }
        path.reverse();
        path
    }
}
