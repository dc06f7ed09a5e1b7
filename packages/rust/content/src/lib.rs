//! Content processing: raw source bytes to plain text plus metadata.
//!
//! [`ContentProcessor`] chains a [`DecoderRegistry`] (format-specific text
//! decoding) with the [`MetadataExtractor`] (topics, difficulty,
//! prerequisites, study time).

mod decode;
mod metadata;

use std::path::Path;
use std::sync::Arc;

use tracing::instrument;
use url::Url;

use lorepath_shared::{NuggetMetadata, ProcessorConfig, Result};

pub use decode::{
    DecodedText, DecoderRegistry, HtmlDecoder, MarkdownDecoder, PlainTextDecoder, TextDecoder,
};
pub use metadata::MetadataExtractor;

/// Text and metadata ready to become a content unit.
#[derive(Debug, Clone)]
pub struct ProcessedContent {
    pub title: String,
    pub text: String,
    pub metadata: NuggetMetadata,
}

/// Decodes sources and extracts their metadata.
#[derive(Clone)]
pub struct ContentProcessor {
    decoders: DecoderRegistry,
    extractor: MetadataExtractor,
}

impl ContentProcessor {
    /// Processor with the built-in decoders.
    pub fn new(config: ProcessorConfig) -> Self {
        Self::with_decoders(config, DecoderRegistry::with_defaults())
    }

    pub fn with_decoders(config: ProcessorConfig, decoders: DecoderRegistry) -> Self {
        Self {
            decoders,
            extractor: MetadataExtractor::new(config),
        }
    }

    /// Register an extra decoder (e.g. PDF) on this processor.
    pub fn register_decoder(&mut self, decoder: Arc<dyn TextDecoder>) {
        self.decoders.register(decoder);
    }

    /// Decode `bytes` read from `source` and extract metadata.
    ///
    /// Decoding errors propagate; metadata extraction never fails.
    #[instrument(skip_all, fields(source = %source, bytes = bytes.len()))]
    pub fn process(
        &self,
        bytes: &[u8],
        source: &str,
        content_type: Option<&str>,
        known_topics: &[String],
    ) -> Result<ProcessedContent> {
        let decoded = self.decoders.decode(bytes, source, content_type)?;
        let metadata = self.extractor.extract(&decoded.text, known_topics);
        let title = decoded.title.unwrap_or_else(|| title_from_source(source));
        Ok(ProcessedContent {
            title,
            text: decoded.text,
            metadata,
        })
    }

    pub fn extractor(&self) -> &MetadataExtractor {
        &self.extractor
    }
}

/// File name of a path, or the last URL path segment (host if none).
pub fn title_from_source(source: &str) -> String {
    if let Ok(url) = Url::parse(source) {
        if url.scheme() == "http" || url.scheme() == "https" {
            return url
                .path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_string))
                .or_else(|| url.host_str().map(str::to_string))
                .unwrap_or_else(|| source.to_string());
        }
    }
    Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| source.to_string())
}
