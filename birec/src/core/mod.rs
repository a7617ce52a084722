pub mod recorder;
pub mod statistics;

pub use recorder::{Recorder, RecordingArtifact, RunningStatus};
pub use statistics::RateCounter;
