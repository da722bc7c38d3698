use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use vector_store::ChunkStructure;

use crate::PipelineError;

/// A structural span a parser attaches to part of the document, expressed in
/// byte offsets over [`ParsedDocument::text`].
#[derive(Debug, Clone)]
pub struct StructuralSpan {
    pub start: usize,
    pub end: usize,
    pub structure: ChunkStructure,
}

/// Parser output: the indexable text, sentence end offsets (when the format
/// makes them knowable), and structural coordinates.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub sentence_ends: Vec<usize>,
    pub spans: Vec<StructuralSpan>,
}

impl ParsedDocument {
    pub fn structure_at(&self, offset: usize) -> Option<ChunkStructure> {
        self.spans
            .iter()
            .rev()
            .find(|span| span.start <= offset && offset < span.end)
            .map(|span| span.structure.clone())
    }
}

/// Format-specific extraction. PDF and office parsers are collaborators that
/// plug in here; the daemon ships text and markdown.
pub trait DocumentParser: Send + Sync {
    fn kind(&self) -> &'static str;
    fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

pub struct ParserRegistry {
    by_extension: HashMap<&'static str, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// The built-in set: plain text and markdown.
    pub fn with_builtin_parsers() -> Self {
        let mut registry = Self::empty();
        let text: Arc<dyn DocumentParser> = Arc::new(PlainTextParser);
        let markdown: Arc<dyn DocumentParser> = Arc::new(MarkdownParser);

        registry.register("txt", Arc::clone(&text));
        registry.register("csv", text);
        registry.register("md", Arc::clone(&markdown));
        registry.register("markdown", markdown);
        registry
    }

    pub fn register(&mut self, extension: &'static str, parser: Arc<dyn DocumentParser>) {
        self.by_extension.insert(extension, parser);
    }

    pub fn parser_for(&self, path: &Path) -> Option<&Arc<dyn DocumentParser>> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(extension.as_str())
    }

    pub fn parse(&self, path: &Path) -> Result<(String, ParsedDocument), PipelineError> {
        let rel_display = path.display().to_string();
        let Some(parser) = self.parser_for(path) else {
            return Err(PipelineError::NoParser { path: rel_display });
        };

        let parsed = parser.parse(path).map_err(|error| PipelineError::ParseFailed {
            path: rel_display,
            message: error.to_string(),
        })?;

        Ok((parser.kind().to_string(), parsed))
    }
}

pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn kind(&self) -> &'static str {
        "text"
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let sentence_ends = detect_sentence_ends(&text);

        Ok(ParsedDocument {
            text,
            sentence_ends,
            spans: Vec::new(),
        })
    }
}

pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn kind(&self) -> &'static str {
        "markdown"
    }

    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let sentence_ends = detect_sentence_ends(&text);
        let spans = heading_spans(&text);

        Ok(ParsedDocument {
            text,
            sentence_ends,
            spans,
        })
    }
}

/// Walk the markdown structure and record which heading governs each region.
fn heading_spans(text: &str) -> Vec<StructuralSpan> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);

    let parser = Parser::new_ext(text, options).into_offset_iter();

    let mut spans: Vec<StructuralSpan> = Vec::new();
    let mut in_heading = false;
    let mut heading_text = String::new();
    let mut heading_start = 0usize;

    for (event, range) in parser {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                in_heading = true;
                heading_text.clear();
                heading_start = range.start;
            }
            Event::Text(value) if in_heading => {
                heading_text.push_str(&value);
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                if let Some(last) = spans.last_mut() {
                    last.end = heading_start;
                }
                spans.push(StructuralSpan {
                    start: heading_start,
                    end: text.len(),
                    structure: ChunkStructure {
                        heading: Some(heading_text.trim().to_string()),
                        ..ChunkStructure::default()
                    },
                });
            }
            _ => {}
        }
    }

    spans
}

/// Byte offsets just past each sentence terminator. Good enough to keep the
/// chunker from splitting mid-sentence; not a linguistic segmenter.
pub(crate) fn detect_sentence_ends(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut ends = Vec::new();

    for (index, byte) in bytes.iter().enumerate() {
        let is_terminator = matches!(byte, b'.' | b'!' | b'?' | b'\n');
        if !is_terminator {
            continue;
        }

        let next = bytes.get(index + 1);
        let followed_by_break = next.is_none() || next.is_some_and(|b| b.is_ascii_whitespace());
        if followed_by_break {
            ends.push(index + 1);
        }
    }

    if ends.last() != Some(&text.len()) && !text.is_empty() {
        ends.push(text.len());
    }

    ends
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::{detect_sentence_ends, ParserRegistry};
    use crate::PipelineError;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!("indexing-parser-{nanos}"));
        fs::create_dir_all(&dir).expect("temp dir should be created");
        let path = dir.join(name);
        fs::write(&path, contents).expect("file should be written");
        path
    }

    #[test]
    fn sentence_ends_cover_terminators_and_eof() {
        let ends = detect_sentence_ends("First. Second! Third");
        assert_eq!(ends, vec![6, 14, 20]);
    }

    #[test]
    fn registry_parses_markdown_with_heading_structure() {
        let path = temp_file(
            "doc.md",
            "# Policy\n\nRemote work is allowed.\n\n# Hours\n\nCore hours are flexible.\n",
        );

        let registry = ParserRegistry::with_builtin_parsers();
        let (kind, parsed) = registry.parse(&path).expect("markdown should parse");
        assert_eq!(kind, "markdown");

        let early = parsed.structure_at(12).expect("policy section structure");
        assert_eq!(early.heading.as_deref(), Some("Policy"));

        let late_offset = parsed.text.find("Core hours").expect("hours text");
        let late = parsed.structure_at(late_offset).expect("hours section structure");
        assert_eq!(late.heading.as_deref(), Some("Hours"));
    }

    #[test]
    fn unknown_extensions_surface_no_parser() {
        let path = temp_file("deck.pptx", "binary-ish");
        let registry = ParserRegistry::with_builtin_parsers();

        match registry.parse(&path) {
            Err(PipelineError::NoParser { path: reported }) => {
                assert!(reported.ends_with("deck.pptx"));
            }
            other => panic!("expected NoParser, got {other:?}"),
        }
    }
}
