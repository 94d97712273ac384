use std::{collections::BTreeMap, thread};

pub const KB: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Encodes the low `out.len()` bytes of `value`.
    pub fn encode(self, value: u64, out: &mut [u8]) {
        let width = out.len();
        debug_assert!(width <= 8);
        match self {
            Self::Little => out.copy_from_slice(&value.to_le_bytes()[..width]),
            Self::Big => out.copy_from_slice(&value.to_be_bytes()[8 - width..]),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> u64 {
        let width = bytes.len();
        debug_assert!(width <= 8);
        let mut raw = [0u8; 8];
        match self {
            Self::Little => {
                raw[..width].copy_from_slice(bytes);
                u64::from_le_bytes(raw)
            }
            Self::Big => {
                raw[8 - width..].copy_from_slice(bytes);
                u64::from_be_bytes(raw)
            }
        }
    }

    pub fn i32_bytes(self, value: i32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    pub fn read_i32(self, bytes: [u8; 4]) -> i32 {
        match self {
            Self::Little => i32::from_le_bytes(bytes),
            Self::Big => i32::from_be_bytes(bytes),
        }
    }
}

/// Word size, byte order and cache line size of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataModel {
    pub word_size: usize,
    pub endianness: Endianness,
    pub cache_alignment: usize,
}

impl DataModel {
    pub fn encode_word(&self, value: u64, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.word_size);
        self.endianness.encode(value, out);
    }

    pub fn decode_word(&self, bytes: &[u8]) -> u64 {
        debug_assert_eq!(bytes.len(), self.word_size);
        self.endianness.decode(bytes)
    }

    pub fn align_to_word(&self, value: u64) -> u64 {
        align_up(value, self.word_size as u64)
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildLevel {
    Product,
    Debug,
}

impl BuildLevel {
    pub fn name(self) -> &'static str {
        match self {
            Self::Product => "PRODUCT",
            Self::Debug => "DEBUG",
        }
    }
}

/// Holder-name prefixes excluded from compilation. A whitelist entry wins
/// over a blacklist entry.
#[derive(Debug, Clone, Default)]
pub struct CompilationPolicy {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

impl CompilationPolicy {
    pub fn excludes(&self, holder_name: &str) -> bool {
        let matches = |list: &[String]| list.iter().any(|prefix| holder_name.starts_with(prefix.as_str()));
        matches(&self.blacklist) && !matches(&self.whitelist)
    }
}

pub const TLA_SLOT_COUNT: usize = 16;

/// Indexes of the thread locals the native substrate accesses directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlaLayout {
    pub safepoint_latch: i32,
    pub etla: i32,
    pub dtla: i32,
    pub ttla: i32,
    pub native_thread_locals: i32,
    pub forward_link: i32,
    pub backward_link: i32,
    pub id: i32,
    pub jni_env: i32,
    pub last_frame_anchor: i32,
    pub trap_number: i32,
    pub trap_instruction_pointer: i32,
    pub trap_fault_address: i32,
    pub trap_latch_register: i32,
    pub stack_reference_map: i32,
    pub stack_reference_map_size: i32,
}

impl Default for TlaLayout {
    fn default() -> Self {
        Self {
            safepoint_latch: 0,
            etla: 1,
            dtla: 2,
            ttla: 3,
            native_thread_locals: 4,
            forward_link: 5,
            backward_link: 6,
            id: 7,
            jni_env: 8,
            last_frame_anchor: 9,
            trap_number: 10,
            trap_instruction_pointer: 11,
            trap_fault_address: 12,
            trap_latch_register: 13,
            stack_reference_map: 14,
            stack_reference_map_size: 15,
        }
    }
}

// Every field left as None falls back to `ImageSettings::default()`.
#[derive(Debug, Default, Clone)]
pub struct ImageCreateInfo {
    pub word_size: Option<usize>,
    pub endianness: Option<Endianness>,
    pub cache_alignment: Option<usize>,
    pub page_size: Option<usize>,
    pub compiler_threads: Option<usize>,
    pub serializer_threads: Option<usize>,
    pub batch_size: Option<usize>,
    pub debug_tagging: Option<bool>,
    pub random_id: Option<i32>,
    pub build_level: Option<BuildLevel>,
    pub isa: Option<String>,
    pub os: Option<String>,
    pub yellow_zone_pages: Option<i32>,
    pub red_zone_pages: Option<i32>,
    pub reserved_virtual_space_kb: Option<i32>,
    pub boot_region_mapping_constraint: Option<i32>,
    pub tla_layout: Option<TlaLayout>,
    // defaults to one word per slot
    pub tla_size: Option<i32>,
    pub policy: Option<CompilationPolicy>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub data_model: DataModel,
    pub page_size: usize,
    pub compiler_threads: usize,
    pub serializer_threads: usize,
    // objects per serialization batch
    pub batch_size: usize,
    pub debug_tagging: bool,
    pub random_id: i32,
    pub build_level: BuildLevel,
    pub isa: String,
    pub os: String,
    pub yellow_zone_pages: i32,
    pub red_zone_pages: i32,
    pub reserved_virtual_space_kb: i32,
    pub boot_region_mapping_constraint: i32,
    pub tla_layout: TlaLayout,
    pub tla_size: i32,
    pub policy: CompilationPolicy,
    /// Scheme and compiler properties recorded verbatim in the string info.
    pub properties: BTreeMap<String, String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            data_model: DataModel {
                word_size: 8,
                endianness: Endianness::Little,
                cache_alignment: 64,
            },
            page_size: 4 * KB,
            compiler_threads: 1,
            serializer_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            batch_size: 10_000,
            debug_tagging: false,
            random_id: rand::random(),
            build_level: BuildLevel::Product,
            isa: host_isa().to_owned(),
            os: host_os().to_owned(),
            yellow_zone_pages: 1,
            red_zone_pages: 1,
            reserved_virtual_space_kb: 0,
            boot_region_mapping_constraint: 0,
            tla_layout: TlaLayout::default(),
            tla_size: (TLA_SLOT_COUNT * 8) as i32,
            policy: CompilationPolicy::default(),
            properties: BTreeMap::new(),
        }
    }
}

impl From<ImageCreateInfo> for ImageSettings {
    fn from(info: ImageCreateInfo) -> Self {
        let mut settings = ImageSettings::default();
        info.word_size
            .inspect(|&val| settings.data_model.word_size = val);
        info.endianness
            .inspect(|&val| settings.data_model.endianness = val);
        info.cache_alignment
            .inspect(|&val| settings.data_model.cache_alignment = val);
        info.page_size.inspect(|&val| settings.page_size = val);
        info.compiler_threads
            .inspect(|&val| settings.compiler_threads = val.max(1));
        info.serializer_threads
            .inspect(|&val| settings.serializer_threads = val.max(1));
        info.batch_size
            .inspect(|&val| settings.batch_size = val.max(1));
        info.debug_tagging
            .inspect(|&val| settings.debug_tagging = val);
        info.random_id.inspect(|&val| settings.random_id = val);
        info.build_level
            .inspect(|&val| settings.build_level = val);
        info.yellow_zone_pages
            .inspect(|&val| settings.yellow_zone_pages = val);
        info.red_zone_pages
            .inspect(|&val| settings.red_zone_pages = val);
        info.reserved_virtual_space_kb
            .inspect(|&val| settings.reserved_virtual_space_kb = val);
        info.boot_region_mapping_constraint
            .inspect(|&val| settings.boot_region_mapping_constraint = val);
        info.tla_layout.inspect(|&val| settings.tla_layout = val);

        settings.tla_size = info.tla_size.unwrap_or(
            (TLA_SLOT_COUNT * settings.data_model.word_size) as i32,
        );
        if let Some(isa) = info.isa {
            settings.isa = isa;
        }
        if let Some(os) = info.os {
            settings.os = os;
        }
        if let Some(policy) = info.policy {
            settings.policy = policy;
        }
        settings.properties = info.properties;
        settings
    }
}

fn host_isa() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "AMD64",
        "aarch64" => "AARCH64",
        "arm" => "ARM",
        "riscv64" => "RISCV64",
        _ => "AMD64",
    }
}

fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "DARWIN",
        "windows" => "WINDOWS",
        "solaris" => "SOLARIS",
        _ => "LINUX",
    }
}
