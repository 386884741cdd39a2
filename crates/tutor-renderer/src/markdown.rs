//! Markdown → HTML for normalized answers.
//!
//! Math is not rendered here. Math nodes are written back out in their fenced
//! form (`$...$`, `$$...$$`) inside marker spans, so a typesetter can find
//! them in the committed markup later.
//!
//! Answers are untrusted model output: raw HTML in them is shown as text,
//! never passed through.

use pulldown_cmark::{CowStr, Event, Options, Parser, html};
use pulldown_cmark_escape::escape_html;

use crate::normalize::NormalizedText;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathMode {
    Inline,
    Display,
}

impl MathMode {
    pub fn class(self) -> &'static str {
        match self {
            MathMode::Inline => "math-inline",
            MathMode::Display => "math-display",
        }
    }

    pub fn delimiter(self) -> &'static str {
        match self {
            MathMode::Inline => "$",
            MathMode::Display => "$$",
        }
    }

    pub fn from_class(class: &str) -> Option<Self> {
        match class {
            "math-inline" => Some(MathMode::Inline),
            "math-display" => Some(MathMode::Display),
            _ => None,
        }
    }
}

/// GFM plus math recognition.
pub fn answer_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_GFM);
    options.insert(Options::ENABLE_MATH);
    options
}

/// Renders a normalized answer to an HTML fragment.
pub fn render_answer(text: &NormalizedText) -> String {
    let parser = Parser::new_ext(text.as_str(), answer_options()).map(|event| match event {
        Event::InlineMath(tex) => Event::InlineHtml(math_span(&tex, MathMode::Inline)),
        Event::DisplayMath(tex) => Event::InlineHtml(math_span(&tex, MathMode::Display)),
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

fn math_span(tex: &str, mode: MathMode) -> CowStr<'static> {
    let delimiter = mode.delimiter();
    let mut span = format!(r#"<span class="math {}">{delimiter}"#, mode.class());
    // Writing to a String can't fail
    let _ = escape_html(&mut span, tex);
    span.push_str(delimiter);
    span.push_str("</span>");
    CowStr::from(span)
}
