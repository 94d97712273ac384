use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::relocation::WordBitmap;
use crate::settings::{Endianness, ImageSettings, KB, align_up};

pub const IDENTIFICATION: u32 = 0xCAFE_4DAD;
pub const FORMAT_VERSION: i32 = 2;

const BIG_ENDIAN_MARKER: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("byte order marker is {0:#x}, expected 0 or 0xffffffff")]
    ByteOrder(u32),
    #[error("identification is {actual:#x}, expected {expected:#x}")]
    WrongIdentification { expected: u32, actual: u32 },
    #[error("format version is {actual}, expected {expected}")]
    WrongVersion { expected: i32, actual: i32 },
    #[error("header field {field} is {actual}, expected {expected}")]
    InvalidHeader {
        field: &'static str,
        expected: &'static str,
        actual: i64,
    },
    #[error("header declares {header} bytes of string info, section has {actual}")]
    StringInfoSize { header: i32, actual: usize },
    #[error("malformed string info: {0}")]
    MalformedStringInfo(&'static str),
    #[error("string info lacks {0}")]
    MissingString(&'static str),
    #[error("string info {key} names unknown constant {value}")]
    UnknownConstant { key: &'static str, value: String },
    #[error("padding byte at file offset {offset} is {value:#x}")]
    NonZeroPadding { offset: usize, value: u8 },
    #[error("{section} section at file offset {offset} is not aligned to page size {page_size}")]
    MisalignedSection {
        section: &'static str,
        offset: usize,
        page_size: usize,
    },
    #[error("{field} of {size} bytes does not fit a header field")]
    SectionTooLarge { field: &'static str, size: usize },
    #[error("trailer {field} is {trailer:#x}, header has {header:#x}")]
    TrailerMismatch {
        field: &'static str,
        header: i32,
        trailer: i32,
    },
}

/// One fixed-width integer field of a section. Writer, reader and printer
/// all walk the same table.
pub struct FieldDesc<S> {
    pub name: &'static str,
    pub width: usize,
    pub get: fn(&S) -> i32,
    pub set: fn(&mut S, i32),
}

pub trait IntSection: Sized + 'static {
    const FIELDS: &'static [FieldDesc<Self>];

    fn size() -> usize {
        Self::FIELDS.iter().map(|f| f.width).sum()
    }

    fn write_fields(&self, endianness: Endianness, w: &mut dyn Write) -> io::Result<()> {
        for field in Self::FIELDS {
            write_i32(w, endianness, (field.get)(self))?;
        }
        Ok(())
    }

    fn read_fields(&mut self, fields: &[FieldDesc<Self>], endianness: Endianness, r: &mut dyn Read) -> io::Result<()> {
        for field in fields {
            (field.set)(self, read_i32(r, endianness)?);
        }
        Ok(())
    }
}

macro_rules! int_section {
    ($(#[$meta:meta])* $name:ident { $($field:ident => $label:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: i32,)*
        }

        impl IntSection for $name {
            const FIELDS: &'static [FieldDesc<$name>] = &[
                $(FieldDesc {
                    name: $label,
                    width: 4,
                    get: |s: &$name| s.$field,
                    set: |s: &mut $name, v: i32| s.$field = v,
                },)*
            ];
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for field in Self::FIELDS {
                    writeln!(f, "{}: {}", field.name, (field.get)(self))?;
                }
                Ok(())
            }
        }
    };
}

int_section! {
    /// Fixed-layout prologue the native loader reads before anything else.
    Header {
        is_big_endian => "isBigEndian",
        identification => "identification",
        format_version => "bootImageFormatVersion",
        random_id => "randomID",
        word_size => "wordSize",
        cache_alignment => "cacheAlignment",
        page_size => "pageSize",
        yellow_zone_pages => "yellowZonePages",
        red_zone_pages => "redZonePages",
        vm_run_method_offset => "vmRunMethodOffset",
        vm_thread_add_method_offset => "vmThreadAddMethodOffset",
        vm_thread_run_method_offset => "vmThreadRunMethodOffset",
        vm_thread_attach_method_offset => "vmThreadAttachMethodOffset",
        vm_thread_detach_method_offset => "vmThreadDetachMethodOffset",
        class_registry_offset => "classRegistryOffset",
        string_info_size => "stringInfoSize",
        relocation_data_size => "relocationDataSize",
        heap_size => "heapSize",
        code_size => "codeSize",
        dynamic_heap_regions_array_field_offset => "dynamicHeapRegionsArrayFieldOffset",
        reserved_virtual_space_size => "reservedVirtualSpaceSize",
        reserved_virtual_space_field_offset => "reservedVirtualSpaceFieldOffset",
        boot_region_mapping_constraint => "bootRegionMappingConstraint",
        tla_list_head_offset => "tlaListHeadOffset",
        exit_code_offset => "exitCodeOffset",
        heap_reference_map_offset => "heapReferenceMapOffset",
        mutable_heap_size => "mutableHeapSize",
        tla_size => "tlaSize",
        safepoint_latch => "SAFEPOINT_LATCH",
        etla => "ETLA",
        dtla => "DTLA",
        ttla => "TTLA",
        native_thread_locals => "NATIVE_THREAD_LOCALS",
        forward_link => "FORWARD_LINK",
        backward_link => "BACKWARD_LINK",
        id => "ID",
        jni_env => "JNI_ENV",
        last_java_frame_anchor => "LAST_JAVA_FRAME_ANCHOR",
        trap_number => "TRAP_NUMBER",
        trap_instruction_pointer => "TRAP_INSTRUCTION_POINTER",
        trap_fault_address => "TRAP_FAULT_ADDRESS",
        trap_latch_register => "TRAP_LATCH_REGISTER",
        stack_reference_map => "STACK_REFERENCE_MAP",
        stack_reference_map_size => "STACK_REFERENCE_MAP_SIZE",
    }
}

int_section! {
    /// Repeats the header's identity at the end of the file.
    Trailer {
        random_id => "randomID",
        format_version => "bootImageFormatVersion",
        identification => "identification",
    }
}

impl Header {
    /// Header for `settings` with every size and offset still zero.
    pub fn from_settings(settings: &ImageSettings) -> Self {
        let model = &settings.data_model;
        let tla = &settings.tla_layout;
        Self {
            is_big_endian: match model.endianness {
                Endianness::Big => BIG_ENDIAN_MARKER,
                Endianness::Little => 0,
            },
            identification: IDENTIFICATION as i32,
            format_version: FORMAT_VERSION,
            random_id: settings.random_id,
            word_size: model.word_size as i32,
            cache_alignment: model.cache_alignment as i32,
            page_size: settings.page_size as i32,
            yellow_zone_pages: settings.yellow_zone_pages,
            red_zone_pages: settings.red_zone_pages,
            reserved_virtual_space_size: settings.reserved_virtual_space_kb,
            boot_region_mapping_constraint: settings.boot_region_mapping_constraint,
            tla_size: settings.tla_size,
            safepoint_latch: tla.safepoint_latch,
            etla: tla.etla,
            dtla: tla.dtla,
            ttla: tla.ttla,
            native_thread_locals: tla.native_thread_locals,
            forward_link: tla.forward_link,
            backward_link: tla.backward_link,
            id: tla.id,
            jni_env: tla.jni_env,
            last_java_frame_anchor: tla.last_frame_anchor,
            trap_number: tla.trap_number,
            trap_instruction_pointer: tla.trap_instruction_pointer,
            trap_fault_address: tla.trap_fault_address,
            trap_latch_register: tla.trap_latch_register,
            stack_reference_map: tla.stack_reference_map,
            stack_reference_map_size: tla.stack_reference_map_size,
            ..Default::default()
        }
    }

    pub fn endianness(&self) -> Endianness {
        if self.is_big_endian == 0 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    pub fn check_identity(&self) -> Result<(), FormatError> {
        if self.identification as u32 != IDENTIFICATION {
            return Err(FormatError::WrongIdentification {
                expected: IDENTIFICATION,
                actual: self.identification as u32,
            });
        }
        if self.format_version != FORMAT_VERSION {
            return Err(FormatError::WrongVersion {
                expected: FORMAT_VERSION,
                actual: self.format_version,
            });
        }
        Ok(())
    }

    pub fn check(&self) -> Result<(), FormatError> {
        self.check_identity()?;
        let invalid = |field, expected, actual: i32| {
            Err(FormatError::InvalidHeader {
                field,
                expected,
                actual: actual as i64,
            })
        };
        if self.word_size != 4 && self.word_size != 8 {
            return invalid("wordSize", "4 or 8", self.word_size);
        }
        if self.cache_alignment <= 4 || (self.cache_alignment as u32).count_ones() != 1 {
            return invalid("cacheAlignment", "a power of two above 4", self.cache_alignment);
        }
        if self.page_size < KB as i32 || self.page_size % KB as i32 != 0 {
            return invalid("pageSize", "a multiple of 1024", self.page_size);
        }
        if self.boot_region_mapping_constraint != 0 && self.reserved_virtual_space_size == 0 {
            return invalid(
                "reservedVirtualSpaceSize",
                "non-zero with a boot region mapping constraint",
                self.reserved_virtual_space_size,
            );
        }
        let sizes = [
            ("stringInfoSize", self.string_info_size),
            ("relocationDataSize", self.relocation_data_size),
            ("heapSize", self.heap_size),
            ("codeSize", self.code_size),
        ];
        for (field, size) in sizes {
            if size < 0 {
                return invalid(field, "a non-negative size", size);
            }
        }
        let words = (self.heap_size as i64 + self.code_size as i64) / self.word_size as i64;
        if (self.relocation_data_size as i64) * 8 < words {
            return invalid(
                "relocationDataSize",
                "one bit per heap and code word",
                self.relocation_data_size,
            );
        }
        Ok(())
    }
}

impl Trailer {
    pub fn of(header: &Header) -> Self {
        Self {
            random_id: header.random_id,
            format_version: header.format_version,
            identification: header.identification,
        }
    }

    pub fn check(&self, header: &Header) -> Result<(), FormatError> {
        let expected = Trailer::of(header);
        for field in Self::FIELDS {
            let (header, trailer) = ((field.get)(&expected), (field.get)(self));
            if header != trailer {
                return Err(FormatError::TrailerMismatch {
                    field: field.name,
                    header,
                    trailer,
                });
            }
        }
        Ok(())
    }
}

pub const BUILD_LEVELS: &[&str] = &["PRODUCT", "DEBUG"];
pub const ISAS: &[&str] = &["AMD64", "AARCH64", "ARM", "RISCV64", "SPARC"];
pub const OPERATING_SYSTEMS: &[&str] = &["LINUX", "DARWIN", "WINDOWS", "SOLARIS", "MAXVE"];

/// Build configuration as ordered key/value strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringInfo {
    pub values: BTreeMap<String, String>,
}

impl StringInfo {
    pub fn from_settings(settings: &ImageSettings) -> Self {
        let mut values = settings.properties.clone();
        values.insert("BUILD".to_owned(), settings.build_level.name().to_owned());
        values.insert("ISA".to_owned(), settings.isa.clone());
        values.insert("OS".to_owned(), settings.os.clone());
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Bytes the section occupies, count included.
    pub fn size(&self) -> usize {
        4 + self
            .values
            .iter()
            .map(|(k, v)| 8 + k.len() + v.len())
            .sum::<usize>()
    }

    pub fn check(&self) -> Result<(), FormatError> {
        let known = [
            ("BUILD", BUILD_LEVELS),
            ("ISA", ISAS),
            ("OS", OPERATING_SYSTEMS),
        ];
        for (key, constants) in known {
            let value = self.get(key).ok_or(FormatError::MissingString(key))?;
            if !constants.iter().any(|c| c.eq_ignore_ascii_case(value)) {
                return Err(FormatError::UnknownConstant {
                    key,
                    value: value.to_owned(),
                });
            }
        }
        Ok(())
    }

    fn write(&self, endianness: Endianness, w: &mut dyn Write) -> io::Result<()> {
        write_i32(w, endianness, self.values.len() as i32)?;
        for (key, value) in &self.values {
            write_string(w, endianness, key)?;
            write_string(w, endianness, value)?;
        }
        Ok(())
    }

    fn read(endianness: Endianness, r: &mut dyn Read) -> Result<Self, FormatError> {
        let count = read_i32(r, endianness)?;
        if count < 0 {
            return Err(FormatError::MalformedStringInfo("negative entry count"));
        }
        let mut values = BTreeMap::new();
        for _ in 0..count {
            let key = read_string(r, endianness)?;
            let value = read_string(r, endianness)?;
            values.insert(key, value);
        }
        Ok(Self { values })
    }
}

/// A complete image: header, build strings, relocation bitmap, heap and
/// code regions, trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImage {
    pub header: Header,
    pub string_info: StringInfo,
    pub relocation_data: Vec<u8>,
    pub heap: Vec<u8>,
    pub code: Vec<u8>,
    pub trailer: Trailer,
}

impl BootImage {
    /// Fills in the section sizes and identity, then validates.
    pub fn new(
        mut header: Header,
        string_info: StringInfo,
        relocation_data: Vec<u8>,
        heap: Vec<u8>,
        code: Vec<u8>,
    ) -> Result<Self, FormatError> {
        header.identification = IDENTIFICATION as i32;
        header.format_version = FORMAT_VERSION;
        header.string_info_size = section_size("stringInfoSize", string_info.size())?;
        header.relocation_data_size = section_size("relocationDataSize", relocation_data.len())?;
        header.heap_size = section_size("heapSize", heap.len())?;
        header.code_size = section_size("codeSize", code.len())?;
        header.check()?;
        string_info.check()?;
        if heap.len() % header.page_size as usize != 0 {
            return Err(FormatError::InvalidHeader {
                field: "heapSize",
                expected: "a multiple of the page size",
                actual: heap.len() as i64,
            });
        }
        Ok(Self {
            header,
            string_info,
            relocation_data,
            heap,
            code,
            trailer: Trailer::of(&header),
        })
    }

    pub fn endianness(&self) -> Endianness {
        self.header.endianness()
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    pub fn relocation_data_offset(&self) -> usize {
        Header::size() + self.string_info.size()
    }

    pub fn padding_offset(&self) -> usize {
        self.relocation_data_offset() + self.relocation_data.len()
    }

    pub fn padding_size(&self) -> usize {
        padding_for(self.padding_offset(), self.page_size())
    }

    pub fn heap_offset(&self) -> usize {
        self.padding_offset() + self.padding_size()
    }

    pub fn code_offset(&self) -> usize {
        self.heap_offset() + self.heap.len()
    }

    pub fn trailer_offset(&self) -> usize {
        self.code_offset() + self.code.len()
    }

    pub fn file_size(&self) -> usize {
        self.trailer_offset() + Trailer::size()
    }

    pub fn write(&self, w: &mut dyn Write) -> io::Result<()> {
        let endianness = self.endianness();
        self.header.write_fields(endianness, w)?;
        self.string_info.write(endianness, w)?;
        w.write_all(&self.relocation_data)?;
        w.write_all(&vec![0u8; self.padding_size()])?;
        w.write_all(&self.heap)?;
        w.write_all(&self.code)?;
        self.trailer.write_fields(endianness, w)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer)?;
        writer.flush()
    }

    /// Reads and validates an image. Identity is checked before any
    /// other field is trusted.
    pub fn read(r: &mut dyn Read) -> Result<Self, FormatError> {
        let mut marker = [0u8; 4];
        r.read_exact(&mut marker)?;
        let endianness = match u32::from_ne_bytes(marker) {
            0 => Endianness::Little,
            u32::MAX => Endianness::Big,
            other => return Err(FormatError::ByteOrder(other)),
        };
        let mut header = Header {
            is_big_endian: i32::from_ne_bytes(marker),
            ..Default::default()
        };
        header.read_fields(&Header::FIELDS[1..3], endianness, r)?;
        header.check_identity()?;
        header.read_fields(&Header::FIELDS[3..], endianness, r)?;
        header.check()?;

        let string_info = StringInfo::read(endianness, r)?;
        if string_info.size() != header.string_info_size as usize {
            return Err(FormatError::StringInfoSize {
                header: header.string_info_size,
                actual: string_info.size(),
            });
        }
        string_info.check()?;

        let relocation_data = read_bytes(r, header.relocation_data_size as usize)?;

        let page_size = header.page_size as usize;
        let padding_offset = Header::size() + string_info.size() + relocation_data.len();
        let padding = read_bytes(r, padding_for(padding_offset, page_size))?;
        if let Some(index) = padding.iter().position(|&b| b != 0) {
            return Err(FormatError::NonZeroPadding {
                offset: padding_offset + index,
                value: padding[index],
            });
        }

        let heap_offset = padding_offset + padding.len();
        check_alignment("heap", heap_offset, page_size)?;
        let heap = read_bytes(r, header.heap_size as usize)?;
        let code_offset = heap_offset + heap.len();
        check_alignment("code", code_offset, page_size)?;
        let code = read_bytes(r, header.code_size as usize)?;

        let mut trailer = Trailer::default();
        trailer.read_fields(Trailer::FIELDS, endianness, r)?;
        trailer.check(&header)?;

        Ok(Self {
            header,
            string_info,
            relocation_data,
            heap,
            code,
            trailer,
        })
    }

    pub fn read_from_file(path: &Path) -> Result<Self, FormatError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::read(&mut reader)
    }

    pub fn relocation_map(&self) -> WordBitmap {
        WordBitmap::from_bytes(
            &self.relocation_data,
            self.endianness(),
            self.header.word_size as usize,
        )
    }

    /// Heap and code as they would sit in memory at `base`: every marked
    /// non-null word has `base` added to it.
    pub fn relocate(&self, base: u64) -> Vec<u8> {
        let word = self.header.word_size as usize;
        let endianness = self.endianness();
        let mut memory = [self.heap.as_slice(), self.code.as_slice()].concat();
        for index in self.relocation_map().marked_words() {
            let at = index * word;
            let Some(slot) = memory.get_mut(at..at + word) else {
                break;
            };
            let value = endianness.decode(slot);
            if value != 0 {
                endianness.encode(value.wrapping_add(base), slot);
            }
        }
        memory
    }
}

fn section_size(field: &'static str, size: usize) -> Result<i32, FormatError> {
    i32::try_from(size).map_err(|_| FormatError::SectionTooLarge { field, size })
}

fn padding_for(offset: usize, page_size: usize) -> usize {
    align_up(offset as u64, page_size as u64) as usize - offset
}

fn check_alignment(section: &'static str, offset: usize, page_size: usize) -> Result<(), FormatError> {
    if offset % page_size != 0 {
        return Err(FormatError::MisalignedSection {
            section,
            offset,
            page_size,
        });
    }
    Ok(())
}

fn write_i32(w: &mut dyn Write, endianness: Endianness, v: i32) -> io::Result<()> {
    w.write_all(&endianness.i32_bytes(v))
}

fn read_i32(r: &mut dyn Read, endianness: Endianness) -> io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(endianness.read_i32(b))
}

fn write_string(w: &mut dyn Write, endianness: Endianness, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    write_i32(w, endianness, bytes.len() as i32)?;
    w.write_all(bytes)
}

fn read_string(r: &mut dyn Read, endianness: Endianness) -> Result<String, FormatError> {
    let len = read_i32(r, endianness)?;
    if len < 0 {
        return Err(FormatError::MalformedStringInfo("negative string length"));
    }
    let buf = read_bytes(r, len as usize)?;
    String::from_utf8(buf).map_err(|_| FormatError::MalformedStringInfo("invalid utf-8"))
}

// Reads through `take` so a corrupt size fails at end of file instead
// of allocating up front.
fn read_bytes(r: &mut dyn Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "image ends inside a section",
        ));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ImageCreateInfo;

    fn mk_image(endianness: Endianness) -> BootImage {
        let settings: ImageSettings = ImageCreateInfo {
            endianness: Some(endianness),
            random_id: Some(0x1234),
            isa: Some("AMD64".into()),
            os: Some("LINUX".into()),
            ..Default::default()
        }
        .into();
        let mut heap = vec![0u8; 4096];
        heap[8..16].copy_from_slice(&match endianness {
            Endianness::Little => 0x40u64.to_le_bytes(),
            Endianness::Big => 0x40u64.to_be_bytes(),
        });
        let mut bitmap = WordBitmap::new(8192, 8);
        bitmap.mark(8);
        bitmap.mark(16);
        BootImage::new(
            Header::from_settings(&settings),
            StringInfo::from_settings(&settings),
            bitmap.to_bytes(endianness),
            heap,
            vec![0xC3; 4096],
        )
        .unwrap()
    }

    fn to_bytes(image: &BootImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image.write(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn header_size_follows_schema() {
        assert_eq!(Header::size(), 4 * Header::FIELDS.len());
        assert_eq!(Header::FIELDS[0].name, "isBigEndian");
        assert_eq!(Header::FIELDS[1].name, "identification");
        assert_eq!(Trailer::size(), 12);
    }

    #[test]
    fn round_trip_in_both_byte_orders() {
        for endianness in [Endianness::Little, Endianness::Big] {
            let image = mk_image(endianness);
            let bytes = to_bytes(&image);
            assert_eq!(bytes.len(), image.file_size());
            assert_eq!(image.heap_offset() % 4096, 0);
            let back = BootImage::read(&mut bytes.as_slice()).unwrap();
            assert_eq!(back, image);
        }
    }

    #[test]
    fn byte_order_marker_reads_the_same_either_way() {
        let little = to_bytes(&mk_image(Endianness::Little));
        let big = to_bytes(&mk_image(Endianness::Big));
        assert_eq!(&little[..4], &[0, 0, 0, 0]);
        assert_eq!(&big[..4], &[0xff; 4]);
        assert_eq!(&big[4..8], &IDENTIFICATION.to_be_bytes());
    }

    #[test]
    fn flipped_identification_bit_is_rejected_first() {
        let mut bytes = to_bytes(&mk_image(Endianness::Little));
        bytes[4] ^= 1;
        // garbage after the identity must not matter
        for b in &mut bytes[12..] {
            *b = 0xAA;
        }
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::WrongIdentification { .. })
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = to_bytes(&mk_image(Endianness::Little));
        bytes[8..12].copy_from_slice(&3i32.to_le_bytes());
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::WrongVersion { actual: 3, .. })
        ));
    }

    #[test]
    fn nonzero_padding_is_rejected() {
        let image = mk_image(Endianness::Little);
        let mut bytes = to_bytes(&image);
        assert!(image.padding_size() > 0);
        bytes[image.padding_offset()] = 1;
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::NonZeroPadding { .. })
        ));
    }

    #[test]
    fn trailer_mismatch_is_rejected() {
        let image = mk_image(Endianness::Little);
        let mut bytes = to_bytes(&image);
        let at = image.trailer_offset();
        bytes[at] ^= 0xFF;
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::TrailerMismatch { field: "randomID", .. })
        ));
    }

    #[test]
    fn shrunken_heap_misaligns_the_code_section() {
        let image = mk_image(Endianness::Little);
        let mut bytes = to_bytes(&image);
        let heap_size_at = 4 * Header::FIELDS.iter().position(|f| f.name == "heapSize").unwrap();
        bytes[heap_size_at..heap_size_at + 4].copy_from_slice(&4088i32.to_le_bytes());
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::MisalignedSection { section: "code", .. })
        ));
    }

    #[test]
    fn header_check_rejects_bad_geometry() {
        let mut header = mk_image(Endianness::Little).header;
        header.word_size = 2;
        assert!(matches!(header.check(), Err(FormatError::InvalidHeader { field: "wordSize", .. })));

        let mut header = mk_image(Endianness::Little).header;
        header.cache_alignment = 48;
        assert!(matches!(header.check(), Err(FormatError::InvalidHeader { field: "cacheAlignment", .. })));

        let mut header = mk_image(Endianness::Little).header;
        header.page_size = 1000;
        assert!(matches!(header.check(), Err(FormatError::InvalidHeader { field: "pageSize", .. })));

        let mut header = mk_image(Endianness::Little).header;
        header.boot_region_mapping_constraint = 1;
        assert!(header.check().is_err());
        header.reserved_virtual_space_size = 1024;
        assert!(header.check().is_ok());
    }

    #[test]
    fn truncated_relocation_data_is_rejected() {
        let image = mk_image(Endianness::Little);
        let mut header = image.header;
        header.relocation_data_size -= 8;
        assert!(matches!(
            header.check(),
            Err(FormatError::InvalidHeader { field: "relocationDataSize", .. })
        ));

        // 8192 bytes of heap and code need 128 bytes of bitmap
        let mut bytes = to_bytes(&image);
        let at = 4 * Header::FIELDS.iter().position(|f| f.name == "relocationDataSize").unwrap();
        bytes[at..at + 4].copy_from_slice(&64i32.to_le_bytes());
        assert!(matches!(
            BootImage::read(&mut bytes.as_slice()),
            Err(FormatError::InvalidHeader { field: "relocationDataSize", actual: 64, .. })
        ));
    }

    #[test]
    fn oversized_sections_do_not_wrap() {
        assert_eq!(section_size("heapSize", 4096).unwrap(), 4096);
        assert!(matches!(
            section_size("heapSize", i32::MAX as usize + 1),
            Err(FormatError::SectionTooLarge { field: "heapSize", .. })
        ));
    }

    #[test]
    fn string_info_constants_are_case_insensitive() {
        let mut info = StringInfo::default();
        info.values.insert("BUILD".into(), "product".into());
        info.values.insert("ISA".into(), "amd64".into());
        info.values.insert("OS".into(), "Linux".into());
        assert!(info.check().is_ok());
        info.values.insert("OS".into(), "Plan9".into());
        assert!(matches!(info.check(), Err(FormatError::UnknownConstant { key: "OS", .. })));
        info.values.remove("ISA");
        assert!(matches!(info.check(), Err(FormatError::MissingString("ISA"))));
    }

    #[test]
    fn relocate_skips_null_words() {
        let image = mk_image(Endianness::Little);
        let memory = image.relocate(0x10_0000);
        assert_eq!(u64::from_le_bytes(memory[8..16].try_into().unwrap()), 0x10_0040);
        // marked but null
        assert_eq!(u64::from_le_bytes(memory[16..24].try_into().unwrap()), 0);
        assert_eq!(memory.len(), 8192);
    }
}
