//! Markdown rendering.
//!
//! [`MarkdownParser`] is the seam the document worker renders through.
//! [`FrontMatterMarkdown`] splits a leading `---` YAML block off the source
//! and renders the remaining body as CommonMark HTML.

use anyhow::{Context, Result};
use pulldown_cmark::{html, Options, Parser};

/// A rendered document: HTML body plus the raw front matter block, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub html: String,
    pub front_matter: Option<String>,
}

pub trait MarkdownParser: Send + Sync {
    fn convert(&self, source: &[u8]) -> Result<Rendered>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrontMatterMarkdown;

impl FrontMatterMarkdown {
    pub fn new() -> Self {
        Self
    }
}

impl MarkdownParser for FrontMatterMarkdown {
    fn convert(&self, source: &[u8]) -> Result<Rendered> {
        let text = std::str::from_utf8(source).context("document is not valid UTF-8")?;
        let (front_matter, body) = split_front_matter(text);

        let options = Options::ENABLE_TABLES
            | Options::ENABLE_FOOTNOTES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS;
        let mut out = String::with_capacity(body.len() * 3 / 2);
        html::push_html(&mut out, Parser::new_ext(body, options));

        Ok(Rendered {
            html: out,
            front_matter: front_matter.map(str::to_string),
        })
    }
}

/// Split `---\n<yaml>\n---\n<body>`. Without an opening fence, or with an
/// unterminated one, the whole text is body.
pub fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let rest = match text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (None, text),
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }
    (None, text)
}
