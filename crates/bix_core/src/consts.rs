// crates/bix_core/src/consts.rs

pub const MAGIC_CATALOG: &[u8; 4] = b"BIXC";
pub const MAGIC_REVERSE: &[u8; 4] = b"BIXR";
pub const VERSION: u16 = 1;

/// magic[4] + version[2] + reserved[2] + count[8]
pub const HDR_SIZE: usize = 16;
pub const CRC_SIZE: usize = 4;

pub const BASELINE_FILE: &str = "baseline.json";
pub const CONFIG_FILE: &str = "config.json";
pub const UNIVERSE_FILE: &str = "universe.num";
/// Held exclusively by a writer for a whole batch or gc run.
pub const LOCK_FILE: &str = "LOCK";

pub const EXT_CATALOG: &str = "cat";
pub const EXT_NUMBERS: &str = "num";
pub const EXT_REVERSE: &str = "rev";

/// Operation invoked through the dispatcher by custom predicates.
pub const OP_EVALUATE_PREDICATE: &str = "evaluate-predicate";

pub const MAX_ATTRIBUTE_LEN: usize = 64;

/// Deepest nesting of forms a query may have.
pub const MAX_QUERY_DEPTH: usize = 256;

/// A numbers file is rewritten with only its live records once the
/// superseded bytes outgrow the live ones by this factor.
pub const COMPACT_DEAD_RATIO: u64 = 1;

// value tags; order of the tags is the order of the types
pub const TAG_BOOL: u8 = 1;
pub const TAG_NUM: u8 = 2;
pub const TAG_STR: u8 = 3;

pub fn generation_dir_name(number: u64) -> String {
    format!("gen-{number:08}")
}
