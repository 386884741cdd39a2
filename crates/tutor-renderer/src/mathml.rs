//! Server-side typesetting: swaps fenced math in committed markup for MathML.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use pulldown_cmark_escape::escape_html;
use pulldown_latex::config::{DisplayMode, RenderConfig};
use pulldown_latex::mathml::push_mathml;
use pulldown_latex::{Parser, Storage};
use regex::{Captures, Regex};

use crate::error::TypesetError;
use crate::markdown::MathMode;
use crate::typeset::Typesetter;

/// Marker spans written by [`render_answer`](crate::markdown::render_answer).
/// Their contents are escaped, so they never contain `<`.
static MATH_SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span class="math (math-inline|math-display)">([^<]*)</span>"#)
        .expect("valid regex literal")
});

#[derive(Debug, Default)]
struct ContainerState {
    markup: String,
    generation: u64,
    /// Typeset output and the commit generation it was made from.
    rendered: Option<(u64, String)>,
}

/// One rendered region of a view. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct Container {
    state: Arc<Mutex<ContainerState>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the container's markup. Any typeset output belonged to the
    /// old markup and is dropped.
    pub fn commit(&self, markup: String) {
        let mut state = self.lock();
        state.markup = markup;
        state.generation += 1;
        state.rendered = None;
    }

    /// Committed markup, before typesetting.
    pub fn markup(&self) -> String {
        self.lock().markup.clone()
    }

    /// What the view shows: typeset output if there is one, raw markup
    /// otherwise.
    pub fn visible(&self) -> String {
        let state = self.lock();
        match &state.rendered {
            Some((_, html)) => html.clone(),
            None => state.markup.clone(),
        }
    }

    pub fn is_typeset(&self) -> bool {
        self.lock().rendered.is_some()
    }

    fn snapshot(&self) -> (u64, String) {
        let state = self.lock();
        (state.generation, state.markup.clone())
    }

    /// Stores output for `generation`. Returns `false` and drops it if newer
    /// markup was committed in the meantime.
    fn store_rendered(&self, generation: u64, html: String) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.rendered = Some((generation, html));
        true
    }

    fn clear_rendered(&self) {
        self.lock().rendered = None;
    }
}

/// Typesets with pulldown-latex. Always ready, there is nothing to load.
#[derive(Debug, Clone, Copy, Default)]
pub struct MathmlTypesetter;

impl Typesetter for MathmlTypesetter {
    type Scope = Container;

    fn is_ready(&self) -> bool {
        true
    }

    fn clear(&self, scope: &Container) {
        scope.clear_rendered();
    }

    async fn typeset(&self, scope: &Container) -> Result<(), TypesetError> {
        let (generation, markup) = scope.snapshot();
        let pass = typeset_markup(&markup);

        if !scope.store_rendered(generation, pass.html) {
            tracing::debug!(generation, "container changed during typesetting, output dropped");
            return Ok(());
        }
        if pass.errors.is_empty() {
            Ok(())
        } else {
            Err(TypesetError::Expressions {
                failed: pass.errors.len(),
                total: pass.total,
                message: pass.errors.join("; "),
            })
        }
    }
}

#[derive(Debug)]
pub struct TypesetPass {
    pub html: String,
    pub total: usize,
    pub errors: Vec<String>,
}

/// Replaces every math marker span in `markup` with MathML. Expressions that
/// fail keep a `math-error` fallback showing their fenced source.
pub fn typeset_markup(markup: &str) -> TypesetPass {
    let mut total = 0;
    let mut errors = Vec::new();

    let html = MATH_SPAN_RE
        .replace_all(markup, |caps: &Captures| {
            let Some(mode) = MathMode::from_class(&caps[1]) else {
                return caps[0].to_string();
            };
            total += 1;
            let fenced = unescape_html(&caps[2]);

            match expression_to_mathml(&fenced, mode) {
                Ok(mathml) => format!(r#"<span class="math {}">{mathml}</span>"#, mode.class()),
                Err(message) => {
                    tracing::debug!(%message, source = %fenced, "expression failed to typeset");
                    let fallback = fallback_span(&fenced, &message, mode);
                    errors.push(message);
                    fallback
                }
            }
        })
        .into_owned();

    TypesetPass {
        html,
        total,
        errors,
    }
}

/// MathML for one fenced expression such as `$x^2$`, or the parser's
/// complaint about it.
fn expression_to_mathml(fenced: &str, mode: MathMode) -> Result<String, String> {
    let delimiter = mode.delimiter();
    let latex = fenced
        .strip_prefix(delimiter)
        .and_then(|s| s.strip_suffix(delimiter))
        .unwrap_or(fenced);

    let storage = Storage::new();
    let events: Vec<_> = Parser::new(latex, &storage).collect();
    let problems: Vec<String> = events
        .iter()
        .filter_map(|event| event.as_ref().err())
        .map(ToString::to_string)
        .collect();
    if !problems.is_empty() {
        return Err(problems.join("; "));
    }

    let config = RenderConfig {
        display_mode: match mode {
            MathMode::Inline => DisplayMode::Inline,
            MathMode::Display => DisplayMode::Block,
        },
        ..Default::default()
    };
    let mut mathml = String::new();
    push_mathml(&mut mathml, events.into_iter(), config).map_err(|err| err.to_string())?;
    Ok(mathml)
}

/// Keeps the expression readable as source, with the error on hover.
fn fallback_span(fenced: &str, message: &str, mode: MathMode) -> String {
    let mut span = format!(r#"<span class="math math-error {}" title=""#, mode.class());
    // Writing to a String can't fail
    let _ = escape_html(&mut span, message);
    span.push_str("\">");
    let _ = escape_html(&mut span, fenced);
    span.push_str("</span>");
    span
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::render_answer;
    use crate::normalize::normalize;

    fn committed(answer: &str) -> Container {
        let container = Container::new();
        container.commit(render_answer(&normalize(answer)));
        container
    }

    #[test]
    fn typesets_inline_and_display_math() {
        let pass = typeset_markup(&render_answer(&normalize(r"Let $x^2$ and \[\frac{a}{b}\]")));
        assert_eq!(pass.total, 2);
        assert!(pass.errors.is_empty());
        assert!(pass.html.contains("<mfrac"));
        assert!(!pass.html.contains("$x^2$"));
        assert!(pass.html.contains(r#"<span class="math math-inline"><math"#));
    }

    #[test]
    fn escaped_source_is_unescaped_before_rendering() {
        let pass = typeset_markup(r#"<span class="math math-inline">$a&lt;b$</span>"#);
        assert!(pass.errors.is_empty());
        assert!(pass.html.contains("<math"));
    }

    #[test]
    fn failed_expression_keeps_fallback() {
        let pass = typeset_markup(r#"<span class="math math-display">$$\frac{a&lt;b$$</span>"#);
        assert_eq!(pass.total, 1);
        assert_eq!(pass.errors.len(), 1);
        assert!(pass.html.contains(r#"class="math math-error math-display""#));
        assert!(pass.html.contains(r"$$\frac{a&lt;b$$</span>"));
        assert!(!pass.html.contains("<math"));
    }

    #[test]
    fn worked_answer_typesets_every_expression() {
        let answer = "**ধাপ ১:** $2+3=5$\n\nসুতরাং \\[\\sum_{i=1}^{n} i = \\frac{n(n+1)}{2}\\]";
        let pass = typeset_markup(&render_answer(&normalize(answer)));
        assert_eq!(pass.total, 2);
        assert!(pass.errors.is_empty(), "{:?}", pass.errors);
        assert_eq!(pass.html.matches("<math").count(), 2);
        assert!(pass.html.contains("<strong>ধাপ ১:</strong>"));
    }

    #[test]
    fn delimiters_are_not_typeset() {
        let mathml = expression_to_mathml("$$x$$", MathMode::Display).unwrap();
        assert!(!mathml.contains('$'));
        let mathml = expression_to_mathml("$x$", MathMode::Inline).unwrap();
        assert!(!mathml.contains('$'));
    }

    #[test]
    fn fallback_escapes_message_and_source() {
        let span = fallback_span("$a<b$", r#"bad "token""#, MathMode::Inline);
        assert_eq!(
            span,
            r#"<span class="math math-error math-inline" title="bad &quot;token&quot;">$a&lt;b$</span>"#
        );
    }

    #[test]
    fn markup_without_math_is_unchanged() {
        let markup = "<p>No math here</p>\n";
        let pass = typeset_markup(markup);
        assert_eq!(pass.total, 0);
        assert_eq!(pass.html, markup);
    }

    #[test]
    fn unescape_handles_ampersand_last() {
        assert_eq!(unescape_html("&amp;lt; &lt;"), "&lt; <");
    }

    #[tokio::test]
    async fn typeset_then_clear_restores_source() {
        let container = committed("area $x^2$");
        let engine = MathmlTypesetter;

        engine.typeset(&container).await.unwrap();
        assert!(container.is_typeset());
        assert!(container.visible().contains("<math"));

        engine.clear(&container);
        assert!(!container.is_typeset());
        assert!(container.visible().contains("$x^2$"));
    }

    #[tokio::test]
    async fn failed_pass_reports_error() {
        let container = Container::new();
        container.commit(
            r#"<p>bad <span class="math math-inline">$\frac{a$</span> and good <span class="math math-inline">$b$</span></p>"#
                .to_string(),
        );
        let err = MathmlTypesetter.typeset(&container).await.unwrap_err();
        assert!(matches!(
            err,
            TypesetError::Expressions {
                failed: 1,
                total: 2,
                ..
            }
        ));
    }

    #[test]
    fn stale_output_is_dropped() {
        let container = committed("$x$");
        let (generation, _) = container.snapshot();
        container.commit("<p>new</p>".to_string());

        assert!(!container.store_rendered(generation, "old".to_string()));
        assert_eq!(container.visible(), "<p>new</p>");
    }

    #[test]
    fn commit_drops_previous_render() {
        let container = committed("$x$");
        let (generation, _) = container.snapshot();
        assert!(container.store_rendered(generation, "rendered".to_string()));
        assert_eq!(container.visible(), "rendered");

        container.commit("<p>next</p>".to_string());
        assert_eq!(container.visible(), "<p>next</p>");
        assert_eq!(container.markup(), "<p>next</p>");
    }
}
