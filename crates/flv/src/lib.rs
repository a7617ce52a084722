pub mod audio;
pub mod avc;
pub mod data;
pub mod encode;
pub mod error;
pub mod framing;
pub mod header;
pub mod parser;
pub mod resolution;
pub mod script;
pub mod tag;
pub mod video;
pub mod writer;

pub use data::FlvData;
pub use error::FlvError;
pub use header::FlvHeader;
pub use parser::{EofMode, FlvParser, FlvStreamParser, PrevTagSizeMode};
pub use resolution::Resolution;
pub use script::{ON_JOIN_POINT, ON_METADATA, ScriptData};
pub use tag::{FlvTag, FlvTagType};
pub use writer::FlvWriter;
