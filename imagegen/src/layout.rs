use crate::{
    compiler::CompiledRoutine,
    object::{Field, HeapObject, ObjectBody, Value},
    settings::DataModel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodePart {
    ScalarLiterals,
    ReferenceLiterals,
    Code,
}

/// Walks the slots of one object cell in layout order.
pub trait CellVisitor {
    fn visit_header(&mut self, offset: u64, name: &'static str, value: Value) {
        let _ = (offset, name, value);
    }

    fn visit_field(&mut self, offset: u64, field: &Field) {
        let _ = (offset, field);
    }

    fn visit_element(&mut self, offset: u64, index: usize, value: Value) {
        let _ = (offset, index, value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("tuple size {size} is smaller than its {header}-byte header")]
    TupleTooSmall { size: u32, header: u64 },
    #[error("field at offset {offset} overlaps the header")]
    FieldInHeader { offset: u32 },
    #[error("field at offset {offset} of width {width} does not fit in {size} bytes")]
    FieldOutOfBounds { offset: u32, width: usize, size: u64 },
    #[error("field at offset {offset} is not aligned to its width {width}")]
    MisalignedField { offset: u32, width: usize },
}

/// Header words: hub, misc and, for arrays, length.
#[derive(Debug, Clone, Copy)]
pub struct ObjectLayout {
    model: DataModel,
}

impl ObjectLayout {
    pub const HUB: &'static str = "hub";
    pub const MISC: &'static str = "misc";
    pub const LENGTH: &'static str = "length";

    pub fn new(model: DataModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    fn word(&self) -> u64 {
        self.model.word_size as u64
    }

    pub fn tuple_header_size(&self) -> u64 {
        2 * self.word()
    }

    pub fn array_header_size(&self) -> u64 {
        3 * self.word()
    }

    pub fn element_size(&self, body: &ObjectBody) -> u64 {
        match body {
            ObjectBody::ByteArray(_) => 1,
            _ => self.word(),
        }
    }

    pub fn element_offset(&self, body: &ObjectBody, index: usize) -> u64 {
        self.array_header_size() + index as u64 * self.element_size(body)
    }

    pub fn cell_size(&self, object: &HeapObject) -> Result<u64, LayoutError> {
        let raw = match &object.body {
            ObjectBody::Tuple { size, fields } => {
                self.check_tuple(*size, fields)?;
                *size as u64
            }
            ObjectBody::ReferenceArray(e) => self.element_offset(&object.body, e.len()),
            ObjectBody::ByteArray(e) => self.element_offset(&object.body, e.len()),
            ObjectBody::WordArray(e) => self.element_offset(&object.body, e.len()),
        };
        Ok(self.model.align_to_word(raw))
    }

    fn check_tuple(&self, size: u32, fields: &[Field]) -> Result<(), LayoutError> {
        let header = self.tuple_header_size();
        if (size as u64) < header {
            return Err(LayoutError::TupleTooSmall { size, header });
        }
        let size = self.model.align_to_word(size as u64);
        for field in fields {
            let width = field.value.width(self.model.word_size);
            if (field.offset as u64) < header {
                return Err(LayoutError::FieldInHeader {
                    offset: field.offset,
                });
            }
            if field.offset as u64 + width as u64 > size {
                return Err(LayoutError::FieldOutOfBounds {
                    offset: field.offset,
                    width,
                    size,
                });
            }
            if field.offset as usize % width != 0 {
                return Err(LayoutError::MisalignedField {
                    offset: field.offset,
                    width,
                });
            }
        }
        Ok(())
    }

    pub fn visit_cell(&self, object: &HeapObject, visitor: &mut impl CellVisitor) {
        let word = self.word();
        visitor.visit_header(0, Self::HUB, Value::Reference(object.hub));
        visitor.visit_header(word, Self::MISC, Value::Word(0));
        match &object.body {
            ObjectBody::Tuple { fields, .. } => {
                for field in fields {
                    visitor.visit_field(field.offset as u64, field);
                }
            }
            body => {
                let length = match body {
                    ObjectBody::ReferenceArray(e) => e.len(),
                    ObjectBody::ByteArray(e) => e.len(),
                    ObjectBody::WordArray(e) => e.len(),
                    ObjectBody::Tuple { .. } => unreachable!(),
                };
                visitor.visit_header(2 * word, Self::LENGTH, Value::Word(length as u64));
                for index in 0..length {
                    let value = match body {
                        ObjectBody::ReferenceArray(e) => Value::Reference(e[index]),
                        ObjectBody::ByteArray(e) => Value::I8(e[index] as i8),
                        ObjectBody::WordArray(e) => Value::Word(e[index]),
                        ObjectBody::Tuple { .. } => unreachable!(),
                    };
                    visitor.visit_element(self.element_offset(body, index), index, value);
                }
            }
        }
    }
}

/// Placement of one compiled routine's sub-objects, in the order they
/// are laid out in the code region.
#[derive(Debug, Clone)]
pub struct CodeBundle {
    pub parts: Vec<(CodePart, HeapObject)>,
}

impl CodeBundle {
    pub fn new(compiled: &CompiledRoutine, hubs: &crate::object::WellKnownHubs) -> Self {
        let mut parts = Vec::with_capacity(3);
        if !compiled.scalar_literals.is_empty() {
            parts.push((
                CodePart::ScalarLiterals,
                HeapObject::bytes(hubs.byte_array, compiled.scalar_literals.clone()),
            ));
        }
        if !compiled.reference_literals.is_empty() {
            parts.push((
                CodePart::ReferenceLiterals,
                HeapObject::references(
                    hubs.reference_array,
                    compiled.reference_literals.iter().copied().map(Some).collect(),
                ),
            ));
        }
        parts.push((
            CodePart::Code,
            HeapObject::bytes(hubs.byte_array, compiled.code.clone()),
        ));
        Self { parts }
    }

    pub fn size(&self, layout: &ObjectLayout) -> Result<u64, LayoutError> {
        self.parts
            .iter()
            .map(|(_, object)| layout.cell_size(object))
            .sum()
    }
}
