//! Repair chain for recorded FLV streams.
//!
//! Raw live streams arrive fragmented, with broken timestamps, duplicated
//! reconnect data and occasional codec parameter changes. This crate turns
//! that into well-formed files: each operator implements one repair concern
//! as a [`pipeline_common::Processor`] over [`flv::FlvData`], and
//! [`pipeline::build_pipeline`] composes them in the canonical order.

pub mod analyzer;
pub mod join_point;
pub mod metadata;
pub mod operators;
pub mod pipeline;
pub mod prober;
pub mod script_modifier;

#[cfg(test)]
pub mod test_utils;

pub use analyzer::AnalyserOperator;
pub use join_point::{JoinPoint, JoinPointExtractorOperator};
pub use metadata::{KeyFrames, MetaData};
pub use operators::{
    ConcatOperator, CorrectOperator, CutHandle, CutOperator, DefragmentOperator, DumpEvent,
    DumpEventSink, DumpOperator, GopSortOperator, InjectOperator, LimitOperator,
    MetadataProvider, PathProvider, SplitOperator, TagFilterOperator, TimingRepairOperator,
};
pub use pipeline::{FlvPipelineConfig, FlvPipelineSinks, build_pipeline};
pub use prober::{ProberOperator, ProfileSink, StreamProfile, ffprobe};
