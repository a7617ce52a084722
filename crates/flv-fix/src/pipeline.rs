//! # FLV Processing Pipeline
//!
//! Assembles the repair chain in its canonical order:
//!
//! ```text
//! input → Defragment → GopSort → TagFilter → Split → TimingRepair → Concat
//!       → Cut → Correct → Limit → Correct → JoinPointExtractor → Prober
//!       → Inject → Analyser → Dump
//! ```
//!
//! The front of the chain normalizes the raw network stream (drops stubs,
//! orders GOPs, splits on parameter changes, repairs timestamps, stitches
//! reconnects); the back of the chain shapes output files (cuts, limits,
//! metadata, disk).

use std::sync::Arc;

use flv::data::FlvData;
use pipeline_common::{Pipeline, StreamerContext};

use crate::analyzer::{AnalyserOperator, DurationSink, MetadataSink};
use crate::join_point::{JoinPoint, JoinPointExtractorOperator};
use crate::operators::{
    ConcatOperator, CorrectOperator, CutHandle, CutOperator, DefragmentOperator, DumpEventSink,
    DumpOperator, GopSortOperator, InjectOperator, LimitOperator, MetadataProvider, PathProvider,
    SplitOperator, TagFilterOperator, TimingRepairOperator,
};
use crate::prober::{ProberOperator, ProfileSink};

/// Static knobs for one recording session.
#[derive(Debug, Clone)]
pub struct FlvPipelineConfig {
    /// Per-file size limit in bytes; 0 disables it.
    pub filesize_limit: u64,
    /// Per-file duration limit in seconds; 0 disables it.
    pub duration_limit: u64,
    /// Write buffer size for the dumper.
    pub buffer_size: usize,
}

impl Default for FlvPipelineConfig {
    fn default() -> Self {
        Self {
            filesize_limit: 0,
            duration_limit: 0,
            buffer_size: crate::operators::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Callbacks through which the pipeline reports to its owner.
pub struct FlvPipelineSinks {
    pub metadata: MetadataSink,
    pub duration: Option<DurationSink>,
    pub join_points: Box<dyn Fn(Vec<JoinPoint>) + Send>,
    pub profile: ProfileSink,
    pub dump_events: DumpEventSink,
}

/// Build the full repair chain for one recording session.
pub fn build_pipeline(
    context: Arc<StreamerContext>,
    config: FlvPipelineConfig,
    cut_handle: CutHandle,
    metadata_provider: MetadataProvider,
    path_provider: PathProvider,
    sinks: FlvPipelineSinks,
) -> Pipeline<FlvData> {
    let mut analyser = AnalyserOperator::new(context.clone(), sinks.metadata);
    if let Some(duration) = sinks.duration {
        analyser = analyser.with_duration_sink(duration);
    }

    Pipeline::new(context.clone())
        .add_processor(DefragmentOperator::new(context.clone()))
        .add_processor(GopSortOperator::new(context.clone()))
        .add_processor(TagFilterOperator::new(context.clone()))
        .add_processor(SplitOperator::new(context.clone()))
        .add_processor(TimingRepairOperator::new(context.clone()))
        .add_processor(ConcatOperator::new(context.clone()))
        .add_processor(CutOperator::new(context.clone(), cut_handle))
        .add_processor(CorrectOperator::new(context.clone()))
        .add_processor(LimitOperator::new(
            context.clone(),
            config.filesize_limit,
            config.duration_limit,
        ))
        .add_processor(CorrectOperator::new(context.clone()))
        .add_processor(JoinPointExtractorOperator::new(
            context.clone(),
            sinks.join_points,
        ))
        .add_processor(ProberOperator::new(context.clone(), sinks.profile))
        .add_processor(InjectOperator::new(context.clone(), metadata_provider))
        .add_processor(analyser)
        .add_processor(DumpOperator::new(
            context,
            path_provider,
            config.buffer_size,
            sinks.dump_events,
        ))
}
