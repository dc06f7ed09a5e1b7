//! Format-specific decoders that turn raw source bytes into plain text.
//!
//! Decoders are looked up by content type first, then by the source's file
//! extension. Formats with no registered decoder fail with a
//! [`LorepathError::Decode`], which the orchestrator never retries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use lorepath_shared::{LorepathError, Result};

/// Plain text produced by a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    /// Title found inside the document, if any.
    pub title: Option<String>,
    pub text: String,
}

/// Converts one family of source formats to plain text.
pub trait TextDecoder: Send + Sync {
    /// Decoder name for logs.
    fn name(&self) -> &'static str;

    /// Lowercase file extensions this decoder handles, without the dot.
    fn extensions(&self) -> &[&'static str];

    /// MIME types this decoder handles.
    fn content_types(&self) -> &[&'static str] {
        &[]
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedText>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Decoders keyed by extension and content type.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    by_extension: HashMap<String, Arc<dyn TextDecoder>>,
    by_content_type: HashMap<String, Arc<dyn TextDecoder>>,
}

impl DecoderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the plain text, Markdown and HTML decoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextDecoder));
        registry.register(Arc::new(MarkdownDecoder));
        registry.register(Arc::new(HtmlDecoder));
        registry
    }

    /// Add a decoder, replacing any earlier one for the same keys.
    pub fn register(&mut self, decoder: Arc<dyn TextDecoder>) {
        for ext in decoder.extensions() {
            self.by_extension
                .insert(ext.to_ascii_lowercase(), Arc::clone(&decoder));
        }
        for ct in decoder.content_types() {
            self.by_content_type
                .insert(ct.to_ascii_lowercase(), Arc::clone(&decoder));
        }
    }

    /// Pick the decoder for a source, if one is registered.
    pub fn find(&self, source: &str, content_type: Option<&str>) -> Option<Arc<dyn TextDecoder>> {
        if let Some(ct) = content_type.map(normalize_content_type) {
            if let Some(decoder) = self.by_content_type.get(&ct) {
                return Some(Arc::clone(decoder));
            }
        }
        source_extension(source).and_then(|ext| self.by_extension.get(&ext).cloned())
    }

    /// Decode `bytes` read from `source`.
    pub fn decode(
        &self,
        bytes: &[u8],
        source: &str,
        content_type: Option<&str>,
    ) -> Result<DecodedText> {
        let decoder = self.find(source, content_type).ok_or_else(|| {
            LorepathError::Decode(format!(
                "no decoder for {source} (content type {})",
                content_type.unwrap_or("unknown")
            ))
        })?;
        debug!(decoder = decoder.name(), source, "decoding source");
        decoder.decode(bytes)
    }
}

fn normalize_content_type(ct: &str) -> String {
    ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase()
}

/// Lowercase extension of a file path or URL path.
fn source_extension(source: &str) -> Option<String> {
    let path = match Url::parse(source) {
        Ok(url) if url.scheme() != "file" => url.path().to_string(),
        Ok(url) => url.to_file_path().ok()?.to_string_lossy().into_owned(),
        Err(_) => source.to_string(),
    };
    Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| LorepathError::Decode(format!("invalid UTF-8: {e}")))
}

/// Normalize line endings and collapse runs of blank lines.
fn normalize_text(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let unix = text.replace("\r\n", "\n");
    let trimmed: Vec<&str> = unix.lines().map(str::trim_end).collect();
    MULTI_BLANK_RE
        .replace_all(&trimmed.join("\n"), "\n\n")
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Built-in decoders
// ---------------------------------------------------------------------------

/// UTF-8 text passed through unchanged apart from whitespace normalization.
pub struct PlainTextDecoder;

impl TextDecoder for PlainTextDecoder {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extensions(&self) -> &[&'static str] {
        &["txt", "text"]
    }

    fn content_types(&self) -> &[&'static str] {
        &["text/plain"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedText> {
        Ok(DecodedText {
            title: None,
            text: normalize_text(utf8(bytes)?),
        })
    }
}

/// Markdown kept as text; the first H1 becomes the title.
pub struct MarkdownDecoder;

impl TextDecoder for MarkdownDecoder {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn extensions(&self) -> &[&'static str] {
        &["md", "markdown"]
    }

    fn content_types(&self) -> &[&'static str] {
        &["text/markdown"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedText> {
        let text = normalize_text(utf8(bytes)?);
        Ok(DecodedText {
            title: first_h1(&text),
            text,
        })
    }
}

fn first_h1(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE
        .captures(md)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// HTML reduced to its main content and converted to Markdown-flavoured text.
pub struct HtmlDecoder;

impl TextDecoder for HtmlDecoder {
    fn name(&self) -> &'static str {
        "html"
    }

    fn extensions(&self) -> &[&'static str] {
        &["html", "htm"]
    }

    fn content_types(&self) -> &[&'static str] {
        &["text/html", "application/xhtml+xml"]
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedText> {
        let html = String::from_utf8_lossy(bytes);
        let doc = Html::parse_document(&html);
        let title = html_title(&doc);
        let content_html = main_content_html(&doc).unwrap_or_else(|| html.to_string());

        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "header", "footer", "iframe", "noscript", "svg",
            ])
            .build();
        let markdown = converter
            .convert(&content_html)
            .map_err(|e| LorepathError::Decode(format!("htmd conversion failed: {e}")))?;

        Ok(DecodedText {
            title,
            text: normalize_text(&markdown),
        })
    }
}

/// `<title>`, falling back to the first `<h1>`.
fn html_title(doc: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|sel_str| {
        let selector = Selector::parse(sel_str).ok()?;
        doc.select(&selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

fn main_content_html(doc: &Html) -> Option<String> {
    ["article", "main", "[role=\"main\"]", "body"]
        .iter()
        .find_map(|sel_str| {
            let selector = Selector::parse(sel_str).ok()?;
            doc.select(&selector).next().map(|el| el.inner_html())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePdf;

    impl TextDecoder for FakePdf {
        fn name(&self) -> &'static str {
            "fake-pdf"
        }

        fn extensions(&self) -> &[&'static str] {
            &["pdf"]
        }

        fn decode(&self, _bytes: &[u8]) -> Result<DecodedText> {
            Ok(DecodedText {
                title: Some("From PDF".into()),
                text: "pdf body".into(),
            })
        }
    }

    #[test]
    fn plain_text_is_normalized() {
        let registry = DecoderRegistry::with_defaults();
        let decoded = registry
            .decode(b"line one  \r\n\r\n\r\n\r\nline two\n", "/in/notes.txt", None)
            .unwrap();
        assert_eq!(decoded.text, "line one\n\nline two");
        assert!(decoded.title.is_none());
    }

    #[test]
    fn markdown_title_from_h1() {
        let registry = DecoderRegistry::with_defaults();
        let decoded = registry
            .decode(b"# Linear Algebra\n\nVectors and matrices.", "/in/la.MD", None)
            .unwrap();
        assert_eq!(decoded.title.as_deref(), Some("Linear Algebra"));
        assert!(decoded.text.contains("Vectors and matrices."));
    }

    #[test]
    fn html_strips_chrome_and_finds_title() {
        let html = br#"<html><head><title>Cell Biology</title><style>p{}</style></head>
            <body><nav>Home | About</nav><main><h1>Cells</h1><p>The Cell Membrane
            controls transport.</p></main><script>alert(1)</script></body></html>"#;
        let registry = DecoderRegistry::with_defaults();
        let decoded = registry
            .decode(html, "https://example.com/cells", Some("text/html; charset=utf-8"))
            .unwrap();
        assert_eq!(decoded.title.as_deref(), Some("Cell Biology"));
        assert!(decoded.text.contains("Cell Membrane"));
        assert!(!decoded.text.contains("Home | About"));
        assert!(!decoded.text.contains("alert"));
    }

    #[test]
    fn unknown_format_is_a_decode_error() {
        let registry = DecoderRegistry::with_defaults();
        let err = registry.decode(b"%PDF-1.7", "/incoming/lesson1.pdf", None).unwrap_err();
        assert!(matches!(err, LorepathError::Decode(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn registered_decoder_takes_over() {
        let mut registry = DecoderRegistry::with_defaults();
        registry.register(Arc::new(FakePdf));
        let decoded = registry.decode(b"%PDF", "/incoming/lesson1.pdf", None).unwrap();
        assert_eq!(decoded.text, "pdf body");
    }

    #[test]
    fn url_extension_ignores_query() {
        assert_eq!(
            source_extension("https://example.com/a/notes.md?x=1").as_deref(),
            Some("md")
        );
        assert_eq!(source_extension("/in/Lesson.HTML").as_deref(), Some("html"));
        assert_eq!(source_extension("https://example.com/page"), None);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let registry = DecoderRegistry::with_defaults();
        let err = registry.decode(&[0xff, 0xfe, 0x00], "/in/a.txt", None).unwrap_err();
        assert!(matches!(err, LorepathError::Decode(_)));
    }
}
