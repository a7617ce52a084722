//! # Dump Operator
//!
//! The sink of the chain: writes each sub-stream to its own file on disk.
//! Every header closes the current file (if any) and asks the path provider
//! for a fresh path; tags are written through a buffered FLV writer that
//! only fsyncs on close. File lifecycle and progress are reported through a
//! callback so the recorder can track statistics and sidecar files.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use flv::data::FlvData;
use flv::writer::FlvWriter;
use pipeline_common::{PipelineError, Processor, StreamerContext};
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Supplies the path and the record-start unix timestamp for each new file.
pub type PathProvider = Box<dyn FnMut() -> (PathBuf, i64) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum DumpEvent {
    FileOpened { path: PathBuf, timestamp: i64 },
    FileClosed { path: PathBuf },
    SizeUpdated { bytes: u64 },
    TimestampUpdated { timestamp_ms: u32 },
}

pub type DumpEventSink = Arc<dyn Fn(DumpEvent) + Send + Sync>;

pub struct DumpOperator {
    context: Arc<StreamerContext>,
    path_provider: PathProvider,
    buffer_size: usize,
    on_event: DumpEventSink,
    path: Option<PathBuf>,
    writer: Option<FlvWriter<BufWriter<File>>>,
}

impl DumpOperator {
    pub fn new(
        context: Arc<StreamerContext>,
        path_provider: PathProvider,
        buffer_size: usize,
        on_event: DumpEventSink,
    ) -> Self {
        Self {
            context,
            path_provider,
            buffer_size: buffer_size.max(4 * 1024),
            on_event,
            path: None,
            writer: None,
        }
    }

    fn open_file(&mut self) -> std::io::Result<()> {
        let (path, timestamp) = (self.path_provider)();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        self.writer = Some(FlvWriter::new(BufWriter::with_capacity(
            self.buffer_size,
            file,
        )));
        debug!("{} opened file: {}", self.context.name, path.display());
        (self.on_event)(DumpEvent::FileOpened {
            path: path.clone(),
            timestamp,
        });
        self.path = Some(path);
        Ok(())
    }

    fn close_file(&mut self) -> std::io::Result<()> {
        if let Some(writer) = self.writer.take() {
            let mut buffered = writer.into_inner();
            std::io::Write::flush(&mut buffered)?;
            let file = buffered
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            file.sync_all()?;
            if let Some(path) = self.path.take() {
                debug!("{} closed file: {}", self.context.name, path.display());
                (self.on_event)(DumpEvent::FileClosed { path });
            }
        }
        Ok(())
    }
}

impl Processor<FlvData> for DumpOperator {
    fn process(
        &mut self,
        input: FlvData,
        output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        match &input {
            FlvData::Header(header) => {
                self.close_file()?;
                self.open_file()?;
                let writer = self.writer.as_mut().expect("writer just opened");
                writer.write_header(header)?;
                (self.on_event)(DumpEvent::SizeUpdated {
                    bytes: writer.bytes_written(),
                });
                (self.on_event)(DumpEvent::TimestampUpdated { timestamp_ms: 0 });
            }
            FlvData::Tag(tag) => {
                if let Some(writer) = self.writer.as_mut() {
                    writer.write_tag(tag)?;
                    (self.on_event)(DumpEvent::SizeUpdated {
                        bytes: writer.bytes_written(),
                    });
                    (self.on_event)(DumpEvent::TimestampUpdated {
                        timestamp_ms: tag.timestamp_ms,
                    });
                }
            }
        }
        output(input)
    }

    fn finish(
        &mut self,
        _output: &mut dyn FnMut(FlvData) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        self.close_file()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DumpOperator"
    }
}

impl Drop for DumpOperator {
    fn drop(&mut self) {
        let _ = self.close_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use parking_lot::Mutex;
    use pipeline_common::test_context;

    #[test]
    fn test_one_file_per_header() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let counter = Arc::new(Mutex::new(0u32));

        let events: Arc<Mutex<Vec<DumpEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_ref = events.clone();

        let provider_counter = counter.clone();
        let mut operator = DumpOperator::new(
            test_context(),
            Box::new(move || {
                let mut n = provider_counter.lock();
                *n += 1;
                (base.join(format!("out_{}.flv", *n)), 1700000000 + *n as i64)
            }),
            DEFAULT_BUFFER_SIZE,
            Arc::new(move |event| events_ref.lock().push(event)),
        );

        let mut sink = |_item: FlvData| Ok(());
        for item in [
            create_test_header(),
            create_video_tag(0, true),
            create_video_tag(33, false),
            create_test_header(),
            create_video_tag(0, true),
        ] {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        let first = dir.path().join("out_1.flv");
        let second = dir.path().join("out_2.flv");
        assert!(first.exists());
        assert!(second.exists());

        // First file: 13-byte preamble + two 17-byte tags with back pointers.
        let first_len = std::fs::metadata(&first).unwrap().len();
        assert_eq!(first_len, 13 + 2 * (17 + 4));

        let events = events.lock();
        let opened: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DumpEvent::FileOpened { .. }))
            .collect();
        let closed: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DumpEvent::FileClosed { .. }))
            .collect();
        assert_eq!(opened.len(), 2);
        assert_eq!(closed.len(), 2);
    }

    #[test]
    fn test_written_file_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.flv");
        let provider_path = path.clone();

        let mut operator = DumpOperator::new(
            test_context(),
            Box::new(move || (provider_path.clone(), 0)),
            DEFAULT_BUFFER_SIZE,
            Arc::new(|_| {}),
        );

        let items = vec![
            create_test_header(),
            create_metadata_tag(0),
            create_video_tag(0, true),
            create_audio_tag(5),
        ];
        let mut sink = |_item: FlvData| Ok(());
        for item in items.clone() {
            operator.process(item, &mut sink).unwrap();
        }
        operator.finish(&mut sink).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let parsed = flv::parser::parse_all(&bytes).unwrap();
        assert_eq!(parsed, items);
    }
}
