use crate::PipelineError;

/// A stateful stage in a processing pipeline.
///
/// `process` receives one item and forwards zero or more items downstream
/// through `output`; `finish` flushes whatever the stage buffered when the
/// source ends. Implementations reset their internal state when the item
/// marks a new stream (for FLV chains, a header).
pub trait Processor<T>: Send {
    fn process(
        &mut self,
        input: T,
        output: &mut dyn FnMut(T) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError>;

    fn finish(
        &mut self,
        output: &mut dyn FnMut(T) -> Result<(), PipelineError>,
    ) -> Result<(), PipelineError>;

    fn name(&self) -> &'static str;
}
