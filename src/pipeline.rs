//! Ordered, reversible transform pipelines.
//!
//! A pipeline is a stack of byte transforms (serialization, compression,
//! encryption live behind this seam) applied in list order on send and
//! unwound in reverse order on receive. The pipeline is agnostic to what any
//! transform does; it only needs the contract: a stable numeric identifier,
//! `forward`, and `reverse`, each over an auxiliary string-keyed options bag
//! shared by the whole stack.
//!
//! The header carries a pipeline id rather than the transform list itself;
//! both sides resolve ids through their [`PipelineRegistry`]. A receiver
//! that cannot resolve an id rejects the packet, it never passes bytes
//! through untransformed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use crate::error::TransformError;
use crate::header::PIPELINE_IDENTITY;

/// Stable numeric identifier of one transform implementation.
pub type TransformId = u8;

/// String-keyed auxiliary options shared across a stack's transforms.
pub type OptionsBag = HashMap<String, String>;

const STREAM_CHUNK: usize = 16 * 1024;

/// One reversible byte transform.
pub trait Transform: Send + Sync {
    /// Identifier stable across versions and across both peers.
    fn id(&self) -> TransformId;

    fn forward(&self, options: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError>;

    fn reverse(&self, options: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError>;

    /// Streaming forward pass; returns bytes written to `sink`. The default
    /// materializes, which is correct for any transform; implementations
    /// backed by incremental codecs can override.
    fn forward_stream(
        &self,
        options: &OptionsBag,
        source: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<u64, TransformError> {
        let mut input = Vec::new();
        source.read_to_end(&mut input)?;
        let output = self.forward(options, &input)?;
        sink.write_all(&output)?;
        Ok(output.len() as u64)
    }

    /// Streaming reverse pass; returns bytes written to `sink`.
    fn reverse_stream(
        &self,
        options: &OptionsBag,
        source: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<u64, TransformError> {
        let mut input = Vec::new();
        source.read_to_end(&mut input)?;
        let output = self.reverse(options, &input)?;
        sink.write_all(&output)?;
        Ok(output.len() as u64)
    }
}

/// Ordered stack of transforms plus the shared options bag.
#[derive(Clone)]
pub struct Pipeline {
    id: u8,
    stack: Vec<Arc<dyn Transform>>,
    options: OptionsBag,
}

impl Pipeline {
    /// The empty stack: bytes pass through untouched. Always registered
    /// under [`PIPELINE_IDENTITY`].
    pub fn identity() -> Self {
        Self {
            id: PIPELINE_IDENTITY,
            stack: Vec::new(),
            options: OptionsBag::new(),
        }
    }

    pub fn new(id: u8) -> Self {
        Self {
            id,
            stack: Vec::new(),
            options: OptionsBag::new(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.stack.push(transform);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_identity(&self) -> bool {
        self.stack.is_empty()
    }

    /// Identifier sequence in apply order.
    pub fn transform_ids(&self) -> Vec<TransformId> {
        self.stack.iter().map(|t| t.id()).collect()
    }

    /// Run the stack in list order over `input`.
    pub fn apply(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut data = input.to_vec();
        for transform in &self.stack {
            data = transform.forward(&self.options, &data)?;
        }
        Ok(data)
    }

    /// Run the stack in reverse order, undoing [`Self::apply`].
    pub fn unapply(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut data = input.to_vec();
        for transform in self.stack.iter().rev() {
            data = transform.reverse(&self.options, &data)?;
        }
        Ok(data)
    }

    /// Streaming apply: `source` through the stack into `sink`. Returns the
    /// number of bytes written to `sink`.
    pub fn apply_stream(
        &self,
        source: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<u64, TransformError> {
        self.run_stream(source, sink, Direction::Forward)
    }

    /// Streaming unapply; returns bytes written to `sink`.
    pub fn unapply_stream(
        &self,
        source: &mut dyn Read,
        sink: &mut dyn Write,
    ) -> Result<u64, TransformError> {
        self.run_stream(source, sink, Direction::Reverse)
    }

    fn run_stream(
        &self,
        source: &mut dyn Read,
        sink: &mut dyn Write,
        direction: Direction,
    ) -> Result<u64, TransformError> {
        if self.stack.is_empty() {
            return copy_counted(source, sink);
        }
        let stages: Vec<&Arc<dyn Transform>> = match direction {
            Direction::Forward => self.stack.iter().collect(),
            Direction::Reverse => self.stack.iter().rev().collect(),
        };
        // Stages after the first read from the previous stage's buffer; only
        // the last stage writes to the caller's sink.
        let mut intermediate: Vec<u8> = Vec::new();
        let last = stages.len() - 1;
        let mut written = 0u64;
        for (i, stage) in stages.iter().enumerate() {
            let run = |src: &mut dyn Read, dst: &mut dyn Write| match direction {
                Direction::Forward => stage.forward_stream(&self.options, src, dst),
                Direction::Reverse => stage.reverse_stream(&self.options, src, dst),
            };
            let mut next = Vec::new();
            written = if i == 0 && i == last {
                run(source, sink)?
            } else if i == 0 {
                run(source, &mut next)?
            } else if i == last {
                run(&mut intermediate.as_slice(), sink)?
            } else {
                run(&mut intermediate.as_slice(), &mut next)?
            };
            intermediate = next;
        }
        Ok(written)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

fn copy_counted(source: &mut dyn Read, sink: &mut dyn Write) -> Result<u64, TransformError> {
    let mut chunk = [0u8; STREAM_CHUNK];
    let mut written = 0u64;
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            return Ok(written);
        }
        sink.write_all(&chunk[..n])?;
        written += n as u64;
    }
}

/// Maps the header's pipeline id to a stack. One per node; shared by every
/// connection. Transforms must be stateless or internally synchronized,
/// since concurrent packets run them in parallel.
pub struct PipelineRegistry {
    inner: RwLock<HashMap<u8, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(PIPELINE_IDENTITY, Arc::new(Pipeline::identity()));
        Self {
            inner: RwLock::new(map),
        }
    }

    /// Register a pipeline under its own id, replacing any previous stack
    /// with that id.
    pub fn register(&self, pipeline: Pipeline) {
        let mut map = self.inner.write().expect("pipeline registry poisoned");
        map.insert(pipeline.id(), Arc::new(pipeline));
    }

    pub fn get(&self, id: u8) -> Option<Arc<Pipeline>> {
        self.inner
            .read()
            .expect("pipeline registry poisoned")
            .get(&id)
            .cloned()
    }

    /// Resolve an id or fail the packet with an unknown-pipeline error.
    pub fn resolve(&self, id: u8) -> Result<Arc<Pipeline>, TransformError> {
        self.get(id).ok_or(TransformError::UnknownPipeline(id))
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// XOR with a key byte taken from the options bag. Self-inverse.
    struct XorCipher;

    impl Transform for XorCipher {
        fn id(&self) -> TransformId {
            0x20
        }

        fn forward(&self, options: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError> {
            let key = options
                .get("xor.key")
                .and_then(|k| k.parse::<u8>().ok())
                .unwrap_or(0x5a);
            Ok(input.iter().map(|b| b ^ key).collect())
        }

        fn reverse(&self, options: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError> {
            self.forward(options, input)
        }
    }

    /// Run-length coder used as a stand-in compressor: (count, byte) pairs.
    struct RunLength;

    impl Transform for RunLength {
        fn id(&self) -> TransformId {
            0x10
        }

        fn forward(&self, _: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError> {
            let mut out = Vec::new();
            let mut iter = input.iter().peekable();
            while let Some(&byte) = iter.next() {
                let mut run = 1u8;
                while run < u8::MAX && iter.peek() == Some(&&byte) {
                    iter.next();
                    run += 1;
                }
                out.push(run);
                out.push(byte);
            }
            Ok(out)
        }

        fn reverse(&self, _: &OptionsBag, input: &[u8]) -> Result<Vec<u8>, TransformError> {
            if input.len() % 2 != 0 {
                return Err(TransformError::Corrupt {
                    id: self.id(),
                    reason: "odd run-length stream".into(),
                });
            }
            let mut out = Vec::new();
            for pair in input.chunks(2) {
                if pair[0] == 0 {
                    return Err(TransformError::Corrupt {
                        id: self.id(),
                        reason: "zero-length run".into(),
                    });
                }
                out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
            }
            Ok(out)
        }
    }

    fn compress_then_encrypt() -> Pipeline {
        Pipeline::new(5)
            .with_transform(Arc::new(RunLength))
            .with_transform(Arc::new(XorCipher))
            .with_option("xor.key", "77")
    }

    #[test]
    fn roundtrip_two_stage() {
        let pipeline = compress_then_encrypt();
        let input = b"hello".repeat(10_000);
        let wire = pipeline.apply(&input).unwrap();
        assert_ne!(wire, input);
        assert_eq!(pipeline.unapply(&wire).unwrap(), input);
    }

    #[test]
    fn identity_passes_through() {
        let pipeline = Pipeline::identity();
        let input = b"untouched".to_vec();
        assert_eq!(pipeline.apply(&input).unwrap(), input);
        assert_eq!(pipeline.unapply(&input).unwrap(), input);
    }

    #[test]
    fn order_is_reversed_on_unapply() {
        // Applying [rle, xor] then unwinding as [xor] alone must fail or
        // mangle; unwinding the full stack must not.
        let full = compress_then_encrypt();
        let partial = Pipeline::new(5).with_transform(Arc::new(RunLength));
        let input = b"aaaabbbbcccc".to_vec();
        let wire = full.apply(&input).unwrap();
        assert_eq!(full.unapply(&wire).unwrap(), input);
        match partial.unapply(&wire) {
            Ok(mangled) => assert_ne!(mangled, input),
            Err(TransformError::Corrupt { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn corrupt_input_is_an_error_not_a_panic() {
        let pipeline = Pipeline::new(9).with_transform(Arc::new(RunLength));
        let err = pipeline.unapply(&[1, b'x', 3]).unwrap_err();
        assert!(matches!(err, TransformError::Corrupt { .. }));
    }

    #[test]
    fn stream_variant_reports_bytes_written() {
        let pipeline = compress_then_encrypt();
        let input = vec![b'z'; 1000];
        let mut wire = Vec::new();
        let written = pipeline
            .apply_stream(&mut input.as_slice(), &mut wire)
            .unwrap();
        assert_eq!(written as usize, wire.len());

        let mut restored = Vec::new();
        let restored_len = pipeline
            .unapply_stream(&mut wire.as_slice(), &mut restored)
            .unwrap();
        assert_eq!(restored, input);
        assert_eq!(restored_len as usize, input.len());
    }

    #[test]
    fn identity_stream_counts_all_bytes() {
        let pipeline = Pipeline::identity();
        let input = vec![7u8; 50_000];
        let mut out = Vec::new();
        let n = pipeline
            .apply_stream(&mut input.as_slice(), &mut out)
            .unwrap();
        assert_eq!(n, 50_000);
        assert_eq!(out, input);
    }

    #[test]
    fn registry_resolves_identity_by_default() {
        let registry = PipelineRegistry::new();
        assert!(registry.resolve(PIPELINE_IDENTITY).unwrap().is_identity());
        assert!(matches!(
            registry.resolve(42),
            Err(TransformError::UnknownPipeline(42))
        ));
    }

    #[test]
    fn registry_registration_replaces() {
        let registry = PipelineRegistry::new();
        registry.register(compress_then_encrypt());
        assert_eq!(registry.resolve(5).unwrap().transform_ids(), vec![0x10, 0x20]);
        registry.register(Pipeline::new(5).with_transform(Arc::new(XorCipher)));
        assert_eq!(registry.resolve(5).unwrap().transform_ids(), vec![0x20]);
    }
}
