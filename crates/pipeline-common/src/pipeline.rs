//! Generic pipeline composition.
//!
//! A `Pipeline<T>` chains [`Processor`]s so that each stage's output feeds
//! the next stage's input, without intermediate buffering. `run` drives a
//! source iterator to completion (or cancellation) and then flushes every
//! stage in order.

use std::sync::Arc;

use crate::{PipelineError, Processor, StreamerContext};

pub struct Pipeline<T> {
    processors: Vec<Box<dyn Processor<T>>>,
    context: Arc<StreamerContext>,
}

impl<T> Pipeline<T> {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            processors: Vec::new(),
            context,
        }
    }

    /// Add a processor to the end of the pipeline.
    pub fn add_processor<P: Processor<T> + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Process all input through the pipeline.
    ///
    /// Source errors are forwarded to `output` untouched; item processing
    /// errors abort the run. Cancellation is checked between items.
    pub fn run<I, O>(mut self, input: I, output: &mut O) -> Result<(), PipelineError>
    where
        I: Iterator<Item = Result<T, PipelineError>>,
        O: FnMut(Result<T, PipelineError>),
    {
        fn process_inner<T>(
            processors: &mut [Box<dyn Processor<T>>],
            data: T,
            output: &mut dyn FnMut(T) -> Result<(), PipelineError>,
        ) -> Result<(), PipelineError> {
            if let Some((first, rest)) = processors.split_first_mut() {
                let mut intermediate = |data| process_inner(rest, data, output);
                first.process(data, &mut intermediate)
            } else {
                output(data)
            }
        }

        for item in input {
            if self.context.token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match item {
                Ok(data) => {
                    let mut sink = |data: T| {
                        output(Ok(data));
                        Ok(())
                    };
                    process_inner(&mut self.processors, data, &mut sink)?;
                }
                Err(e) => output(Err(e)),
            }
        }

        // Flush each stage through the rest of the chain, front to back.
        for index in 0..self.processors.len() {
            let (current, rest) = self.processors[index..]
                .split_first_mut()
                .expect("index in range");
            let mut sink = |data: T| {
                output(Ok(data));
                Ok(())
            };
            let mut downstream = |data: T| process_inner(rest, data, &mut sink);
            current.finish(&mut downstream)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    /// Doubles every number and drops odd inputs.
    struct DoubleEven;

    impl Processor<u32> for DoubleEven {
        fn process(
            &mut self,
            input: u32,
            output: &mut dyn FnMut(u32) -> Result<(), PipelineError>,
        ) -> Result<(), PipelineError> {
            if input % 2 == 0 {
                output(input * 2)?;
            }
            Ok(())
        }

        fn finish(
            &mut self,
            _output: &mut dyn FnMut(u32) -> Result<(), PipelineError>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "DoubleEven"
        }
    }

    /// Buffers everything and emits the sum on finish.
    struct SumOnFinish(u32);

    impl Processor<u32> for SumOnFinish {
        fn process(
            &mut self,
            input: u32,
            _output: &mut dyn FnMut(u32) -> Result<(), PipelineError>,
        ) -> Result<(), PipelineError> {
            self.0 += input;
            Ok(())
        }

        fn finish(
            &mut self,
            output: &mut dyn FnMut(u32) -> Result<(), PipelineError>,
        ) -> Result<(), PipelineError> {
            output(self.0)
        }

        fn name(&self) -> &'static str {
            "SumOnFinish"
        }
    }

    #[test]
    fn test_stages_compose_in_order() {
        let pipeline = Pipeline::new(test_context())
            .add_processor(DoubleEven)
            .add_processor(SumOnFinish(0));

        let mut results = Vec::new();
        pipeline
            .run((1..=6u32).map(Ok), &mut |item| {
                results.push(item.unwrap());
            })
            .unwrap();

        // 2,4,6 doubled = 4+8+12 = 24, emitted at finish.
        assert_eq!(results, vec![24]);
    }

    #[test]
    fn test_cancellation_stops_the_run() {
        let context = test_context();
        context.token.cancel();
        let pipeline = Pipeline::<u32>::new(context).add_processor(DoubleEven);

        let result = pipeline.run(std::iter::once(Ok(2)), &mut |_| {});
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_source_errors_are_forwarded() {
        let pipeline = Pipeline::<u32>::new(test_context()).add_processor(DoubleEven);

        let input = vec![
            Ok(2),
            Err(PipelineError::ChannelClosed("test")),
            Ok(4),
        ];
        let mut oks = 0;
        let mut errs = 0;
        pipeline
            .run(input.into_iter(), &mut |item| match item {
                Ok(_) => oks += 1,
                Err(_) => errs += 1,
            })
            .unwrap();

        assert_eq!(oks, 2);
        assert_eq!(errs, 1);
    }
}
