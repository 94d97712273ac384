use fixedbitset::FixedBitSet;

use crate::{
    cells::CellKey,
    layout::{CellVisitor, ObjectLayout},
    linker::DispatchPatches,
    object::{Field, HeapObject, Value},
    settings::{Endianness, align_up},
};

/// One bit per machine word of a byte range. Serialized as if the bits
/// were packed into little-endian words, then each word is stored in the
/// target byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordBitmap {
    bits: FixedBitSet,
    word_size: usize,
}

impl WordBitmap {
    pub fn new(byte_len: u64, word_size: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity((byte_len / word_size as u64) as usize),
            word_size,
        }
    }

    pub fn mark(&mut self, address: u64) {
        debug_assert_eq!(address % self.word_size as u64, 0, "unaligned pointer word");
        self.bits.insert((address / self.word_size as u64) as usize);
    }

    pub fn is_marked(&self, address: u64) -> bool {
        address % self.word_size as u64 == 0 && self.bits.contains((address / self.word_size as u64) as usize)
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn words(&self) -> usize {
        self.bits.len()
    }

    /// Word indexes of every set bit, ascending.
    pub fn marked_words(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.ones()
    }

    pub fn byte_len(&self) -> usize {
        align_up(self.bits.len().div_ceil(8) as u64, self.word_size as u64) as usize
    }

    pub fn to_bytes(&self, endianness: Endianness) -> Vec<u8> {
        let mut bytes = vec![0u8; self.byte_len()];
        for bit in self.bits.ones() {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
        if endianness == Endianness::Big {
            for word in bytes.chunks_mut(self.word_size) {
                word.reverse();
            }
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], endianness: Endianness, word_size: usize) -> Self {
        let mut raw = bytes.to_vec();
        if endianness == Endianness::Big {
            for word in raw.chunks_mut(word_size) {
                word.reverse();
            }
        }
        let mut bits = FixedBitSet::with_capacity(raw.len() * 8);
        for (index, byte) in raw.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    bits.insert(index * 8 + bit);
                }
            }
        }
        Self { bits, word_size }
    }
}

/// Which pointer words of a cell to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerScope {
    /// Everything the loader must relocate: hub, reference fields and
    /// elements, and patched dispatch slots.
    Relocation,
    /// Reference fields and elements the mutator may overwrite.
    MutableReferences,
}

struct PointerOffsets<'a> {
    key: CellKey,
    patches: &'a DispatchPatches,
    scope: PointerScope,
    offsets: Vec<u64>,
}

impl CellVisitor for PointerOffsets<'_> {
    fn visit_header(&mut self, offset: u64, _: &'static str, value: Value) {
        if self.scope == PointerScope::Relocation && value.is_reference() {
            self.offsets.push(offset);
        }
    }

    fn visit_field(&mut self, offset: u64, field: &Field) {
        if field.value.is_reference() && !field.relocation_exempt {
            self.offsets.push(offset);
        }
    }

    fn visit_element(&mut self, offset: u64, index: usize, value: Value) {
        if value.is_reference() {
            self.offsets.push(offset);
            return;
        }
        if self.scope == PointerScope::Relocation {
            if let CellKey::Object(table) = self.key {
                if self.patches.get(table, index).is_some() {
                    self.offsets.push(offset);
                }
            }
        }
    }
}

/// Offsets, relative to the cell, of the pointer words of `object`.
pub fn pointer_offsets(
    layout: &ObjectLayout,
    key: CellKey,
    object: &HeapObject,
    patches: &DispatchPatches,
    scope: PointerScope,
) -> Vec<u64> {
    let mut visitor = PointerOffsets {
        key,
        patches,
        scope,
        offsets: Vec::new(),
    };
    layout.visit_cell(object, &mut visitor);
    visitor.offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        object::{ObjectId, Value},
        settings::DataModel,
    };

    fn mk_layout() -> ObjectLayout {
        ObjectLayout::new(DataModel {
            word_size: 8,
            endianness: Endianness::Little,
            cache_alignment: 64,
        })
    }

    #[test]
    fn bitmap_bytes_follow_target_order() {
        let mut map = WordBitmap::new(16 * 8, 8);
        map.mark(0);
        map.mark(9 * 8);
        assert_eq!(map.count(), 2);
        assert!(map.is_marked(72));
        assert!(!map.is_marked(8));

        let le = map.to_bytes(Endianness::Little);
        assert_eq!(le.len(), 8);
        assert_eq!(le[0], 0b0000_0001);
        assert_eq!(le[1], 0b0000_0010);

        let be = map.to_bytes(Endianness::Big);
        assert_eq!(be[7], 0b0000_0001);
        assert_eq!(be[6], 0b0000_0010);
        assert_eq!(
            u64::from_be_bytes(be[..8].try_into().unwrap()),
            u64::from_le_bytes(le[..8].try_into().unwrap())
        );

        let back = WordBitmap::from_bytes(&be, Endianness::Big, 8);
        assert_eq!(back.marked_words().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn relocation_scope_marks_hub_and_skips_exempt_fields() {
        let layout = mk_layout();
        let object = HeapObject::tuple(
            Some(ObjectId(0)),
            40,
            vec![
                Field::new(16, Value::Reference(Some(ObjectId(1)))),
                Field::new(24, Value::I64(5)),
                Field::exempt(32, Value::Reference(Some(ObjectId(2)))),
            ],
        );
        let patches = DispatchPatches::default();
        let key = CellKey::Object(ObjectId(3));
        assert_eq!(
            pointer_offsets(&layout, key, &object, &patches, PointerScope::Relocation),
            vec![0, 16]
        );
        assert_eq!(
            pointer_offsets(&layout, key, &object, &patches, PointerScope::MutableReferences),
            vec![16]
        );
    }

    #[test]
    fn patched_dispatch_slots_are_pointers() {
        let layout = mk_layout();
        let table = HeapObject::words(None, vec![0, 0, 0]);
        let mut patches = DispatchPatches::default();
        patches.insert(ObjectId(7), 1, 0x2000);
        let offsets = pointer_offsets(
            &layout,
            CellKey::Object(ObjectId(7)),
            &table,
            &patches,
            PointerScope::Relocation,
        );
        // hub, then slot 1
        assert_eq!(offsets, vec![0, 24 + 8]);
    }
}
