use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::ParseError;
use crate::formats::{LongTableDecoder, RasterHdrDecoder, RasterJsonDecoder, WideTableDecoder};
use crate::model::{Capability, DecodedFile};

pub trait SourceDecoder: Send + Sync {
    fn format(&self) -> &'static str;
    fn capability(&self) -> Capability;
    fn decode(&self, content: Bytes) -> Result<DecodedFile, ParseError>;
}

/// Format-tag keyed decoder table. Adding a format is one `register` call.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    decoders: HashMap<&'static str, Arc<dyn SourceDecoder>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LongTableDecoder::csv()));
        registry.register(Arc::new(LongTableDecoder::tsv()));
        registry.register(Arc::new(WideTableDecoder));
        registry.register(Arc::new(RasterJsonDecoder));
        registry.register(Arc::new(RasterHdrDecoder));
        registry
    }

    /// Returns the decoder previously registered under the same tag, if any.
    pub fn register(&mut self, decoder: Arc<dyn SourceDecoder>) -> Option<Arc<dyn SourceDecoder>> {
        self.decoders.insert(decoder.format(), decoder)
    }

    pub fn get(&self, format: &str) -> Option<&Arc<dyn SourceDecoder>> {
        self.decoders.get(format)
    }

    pub fn formats(&self) -> Vec<(&'static str, Capability)> {
        let mut formats: Vec<_> = self
            .decoders
            .values()
            .map(|decoder| (decoder.format(), decoder.capability()))
            .collect();
        formats.sort_by_key(|(format, _)| *format);
        formats
    }

    pub fn decode(&self, format: &str, content: Bytes) -> Result<DecodedFile, ParseError> {
        let decoder = self.get(format).ok_or_else(|| ParseError::UnknownFormat {
            format: format.to_string(),
        })?;
        decoder.decode(content)
    }
}
