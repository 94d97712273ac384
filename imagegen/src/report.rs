use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use crate::{
    cells::{CellKey, Synthetic},
    closure::Closure,
    layout::{CellVisitor, CodePart},
    object::{Field, ObjectBody, Value},
    placement::Placement,
    registry::RegistryImpl,
};

/// Writes a report to `path`. Reports are auxiliary, so failure is only
/// a warning.
pub fn save(path: &Path, write: impl FnOnce(&mut dyn Write) -> io::Result<()>) {
    let result = File::create(path).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()
    });
    match result {
        Ok(()) => log::debug!("wrote {}", path.display()),
        Err(e) => log::warn!("could not write {}: {e}", path.display()),
    }
}

/// One line per link, ordered by the linked routine.
pub fn write_link_report(w: &mut dyn Write, registry: &RegistryImpl, closure: &Closure) -> io::Result<()> {
    for link in closure.links() {
        let child = registry.qualified_name(link.child);
        match link.cause {
            None => writeln!(w, "{child} is a VM entry point")?,
            Some(cause) => writeln!(
                w,
                "{} {} {child}",
                registry.qualified_name(cause.parent),
                cause.relationship.as_parent()
            )?,
        }
    }
    Ok(())
}

/// One line per cell in address order, followed by its slots.
pub fn write_region_map(w: &mut dyn Write, registry: &RegistryImpl, placement: &Placement<'_>) -> io::Result<()> {
    for placed in placement.placed() {
        let name = match placed.key {
            CellKey::Object(id) => format!("object {}", id.0),
            CellKey::Synthetic(Synthetic::Sentinel) => "sentinel".to_owned(),
            CellKey::Synthetic(Synthetic::HeapReferenceMap) => "heap reference map".to_owned(),
            CellKey::Synthetic(Synthetic::Filler) => "filler".to_owned(),
            CellKey::Code(routine, part) => {
                let part = match part {
                    CodePart::ScalarLiterals => "scalar literals",
                    CodePart::ReferenceLiterals => "reference literals",
                    CodePart::Code => "code",
                };
                format!("{} of {}", part, registry.qualified_name(routine))
            }
        };
        writeln!(
            w,
            "{:#010x} {:>8} {:?} {name}",
            placed.cell.address, placed.cell.size, placed.cell.region
        )?;

        // byte arrays are summarized by their length alone
        if let ObjectBody::ByteArray(_) = placed.object.body {
            continue;
        }
        let mut slots = SlotPrinter {
            w: &mut *w,
            placement,
            result: Ok(()),
        };
        placement.layout.visit_cell(&placed.object, &mut slots);
        slots.result?;
    }
    Ok(())
}

struct SlotPrinter<'w, 'p, 'a> {
    w: &'w mut dyn Write,
    placement: &'p Placement<'a>,
    result: io::Result<()>,
}

impl SlotPrinter<'_, '_, '_> {
    fn line(&mut self, offset: u64, label: &str, value: Value) {
        if self.result.is_err() {
            return;
        }
        let value = match value {
            Value::Reference(None) => "null".to_owned(),
            Value::Reference(Some(id)) => match self.placement.address_of(id) {
                Some(address) => format!("-> {address:#x}"),
                None => format!("-> object {} (unplaced)", id.0),
            },
            other => format!("{other:?}"),
        };
        self.result = writeln!(self.w, "    +{offset:<4} {label:<8} {value}");
    }
}

impl CellVisitor for SlotPrinter<'_, '_, '_> {
    fn visit_header(&mut self, offset: u64, name: &'static str, value: Value) {
        self.line(offset, name, value);
    }

    fn visit_field(&mut self, offset: u64, field: &Field) {
        let label = if field.relocation_exempt { "weak" } else { "field" };
        self.line(offset, label, field.value);
    }

    fn visit_element(&mut self, offset: u64, index: usize, value: Value) {
        self.line(offset, &format!("[{index}]"), value);
    }
}
