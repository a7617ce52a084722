pub mod concat;
pub mod correct;
pub mod cut;
pub mod defragment;
pub mod dump;
pub mod filter;
pub mod gop_sort;
pub mod inject;
pub mod limit;
pub mod split;
pub mod timing_repair;

pub use concat::ConcatOperator;
pub use correct::CorrectOperator;
pub use cut::{CutHandle, CutOperator};
pub use defragment::DefragmentOperator;
pub use dump::{DEFAULT_BUFFER_SIZE, DumpEvent, DumpEventSink, DumpOperator, PathProvider};
pub use filter::TagFilterOperator;
pub use gop_sort::GopSortOperator;
pub use inject::{InjectOperator, MetadataProvider};
pub use limit::LimitOperator;
pub use split::SplitOperator;
pub use timing_repair::TimingRepairOperator;
