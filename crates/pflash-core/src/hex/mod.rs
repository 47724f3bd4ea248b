//! Intel HEX handling: record codec, streaming parser, memory image and
//! universal hex filtering.

pub mod filter;
pub mod image;
pub mod parser;
pub mod record;

pub use filter::{FilterCache, SourceId, UniversalHexRegionFilter};
pub use image::{AddressWindow, MemoryImage};
pub use parser::{HexParser, HexVersion, ParsedHex, detect_versions, encode_records};
pub use record::{Flavor, HexError, HexRecord, RawRecord, RecordError, RecordType};
