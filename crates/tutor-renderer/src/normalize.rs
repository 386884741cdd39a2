//! Math delimiter normalization for model-generated answers.
//!
//! Language models mix valid `$$...$$`/`$...$` math with bare LaTeX
//! environments, `\[...\]`/`\(...\)` brackets and a recurring
//! `def\arraystretch` typo. [`normalize`] rewrites all of that into
//! `$$` (display) and `$` (inline) fencing so the markdown math extension and
//! the typesetter only ever see one delimiter style.
//!
//! The rewrite is a fixed sequence of passes. Already-fenced math is parked in
//! placeholder tables first so later passes can't touch it, then restored
//! verbatim at the end.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::LazyLock;

use regex::{Captures, Regex};


static DISPLAY_MATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\$\$.*?\$\$").expect("valid regex literal"));

/// `def\arraystretch` with the leading backslash dropped, not already part of
/// a word or an escaped command.
static MISSING_DEF_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^\\a-zA-Z])def\\arraystretch").expect("valid regex literal")
});

static STRETCHED_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\\def\s*\\arraystretch.*?\\end\s*\{\s*array\s*\}")
        .expect("valid regex literal")
});

static BARE_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\\begin\s*\{\s*array\s*\}.*?\\end\s*\{\s*array\s*\}")
        .expect("valid regex literal")
});

/// Start of an array block, fenced or not.
static ARRAY_OPENER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\begin\s*\{\s*array\s*\}|\\def\s*\\arraystretch")
        .expect("valid regex literal")
});

static BRACKET_DISPLAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\\\[(.*?)\\\]").expect("valid regex literal"));

static PAREN_INLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\\\((.*?)\\\)").expect("valid regex literal"));

/// Answer text whose math uses only `$$` and `$` fencing.
///
/// Only [`normalize`] produces this, so anything holding one has been through
/// the full pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NormalizedText(String);

impl NormalizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for NormalizedText {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<&str> for NormalizedText {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Which placeholder table a parked segment lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Display,
    Inline,
    /// Array blocks we fenced ourselves.
    Generated,
}

impl SegmentKind {
    fn tag(self) -> char {
        match self {
            SegmentKind::Display => 'D',
            SegmentKind::Inline => 'I',
            SegmentKind::Generated => 'G',
        }
    }
}

/// Ordered segments pulled out of the text during one normalization call.
/// Token `n` always restores to `segments[n]`.
#[derive(Debug)]
struct PlaceholderTable {
    kind: SegmentKind,
    segments: Vec<String>,
}

impl PlaceholderTable {
    fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            segments: Vec::new(),
        }
    }

    /// Parks `segment` and returns the token that stands in for it.
    fn park(&mut self, sentinel: Sentinel, segment: String) -> String {
        let token = sentinel.token(self.kind, self.segments.len());
        self.segments.push(segment);
        token
    }

    fn get(&self, body: &str) -> Option<&str> {
        let index = body.strip_prefix(self.kind.tag())?;
        let index: usize = index.parse().ok()?;
        self.segments.get(index).map(String::as_str)
    }
}

/// Placeholder tokens look like `<marker><kind><index><marker>`.
///
/// The marker is a private-use character absent from the input, so a token
/// can never be confused with anything the model wrote.
#[derive(Debug, Clone, Copy)]
struct Sentinel {
    marker: char,
}

impl Sentinel {
    fn for_input(input: &str) -> Option<Self> {
        let used: HashSet<char> = input.chars().filter(|c| is_private_use(*c)).collect();
        ('\u{E000}'..='\u{F8FF}')
            .chain('\u{F0000}'..='\u{FFFFD}')
            .find(|c| !used.contains(c))
            .map(|marker| Self { marker })
    }

    fn token(self, kind: SegmentKind, index: usize) -> String {
        format!("{m}{}{index}{m}", kind.tag(), m = self.marker)
    }

    /// Replaces every token belonging to `table` in one left-to-right pass.
    /// Tokens of other tables are copied through untouched.
    fn restore(self, text: &str, table: &PlaceholderTable) -> String {
        if table.segments.is_empty() {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        // Markers only ever come in pairs, so odd parts are token bodies.
        for (i, part) in text.split(self.marker).enumerate() {
            if i % 2 == 0 {
                out.push_str(part);
                continue;
            }
            match table.get(part) {
                Some(segment) => out.push_str(segment),
                None => {
                    out.push(self.marker);
                    out.push_str(part);
                    out.push(self.marker);
                }
            }
        }
        out
    }
}

fn is_private_use(c: char) -> bool {
    matches!(c, '\u{E000}'..='\u{F8FF}' | '\u{F0000}'..='\u{FFFFD}' | '\u{100000}'..='\u{10FFFD}')
}

/// Rewrites raw model output into [`NormalizedText`].
///
/// Passes, in order:
/// 1. park `$$...$$` spans
/// 2. park `$...$` spans (not escaped on either side)
/// 3. restore the backslash on `def\arraystretch`
/// 4. convert `\[...\]`/`\(...\)` spans that wrap an array, and park them
/// 5. fence `\def\arraystretch ... \end{array}` blocks with `$$`
/// 6. fence remaining `\begin{array} ... \end{array}` blocks with `$$`
/// 7. `\[...\]` to `$$...$$`
/// 8. `\(...\)` to `$...$`
/// 9. restore everything parked
///
/// An inline span produced by pass 4 or 8 that would touch a `$` gets a
/// space on that side, otherwise `$a$$$b$$` reads differently the next time
/// through.
///
/// Never fails. Unbalanced delimiters are left as literal text.
pub fn normalize(raw: &str) -> NormalizedText {
    if raw.is_empty() {
        return NormalizedText::default();
    }
    let Some(sentinel) = Sentinel::for_input(raw) else {
        tracing::warn!(len = raw.len(), "no free placeholder marker, leaving answer as-is");
        return NormalizedText(raw.to_string());
    };

    let mut display = PlaceholderTable::new(SegmentKind::Display);
    let mut inline = PlaceholderTable::new(SegmentKind::Inline);
    let mut generated = PlaceholderTable::new(SegmentKind::Generated);

    let text = DISPLAY_MATH_RE
        .replace_all(raw, |caps: &Captures| display.park(sentinel, caps[0].to_string()))
        .into_owned();

    let text = park_inline_math(&text, &mut inline, sentinel);

    let text = MISSING_DEF_ESCAPE_RE
        .replace_all(&text, "${1}\\def\\arraystretch")
        .into_owned();

    let text = park_bracketed_arrays(&text, &BRACKET_DISPLAY_RE, true, &mut generated, sentinel);
    let text = park_bracketed_arrays(&text, &PAREN_INLINE_RE, false, &mut generated, sentinel);

    let text = fence_arrays(&text, &STRETCHED_ARRAY_RE, &mut generated, sentinel);
    let text = fence_arrays(&text, &BARE_ARRAY_RE, &mut generated, sentinel);

    let text = BRACKET_DISPLAY_RE
        .replace_all(&text, |caps: &Captures| {
            let whole = caps.get(0).expect("group 0 always matches");
            pad_display(&text, whole.start(), whole.end(), &format!("$${}$$", &caps[1]))
        })
        .into_owned();

    let text = PAREN_INLINE_RE
        .replace_all(&text, |caps: &Captures| {
            let whole = caps.get(0).expect("group 0 always matches");
            pad_inline(&text, whole.start(), whole.end(), &format!("${}$", &caps[1]), sentinel)
        })
        .into_owned();

    // Generated blocks may hold inline tokens, inline spans may hold display
    // tokens, so unwrap from the outside in.
    let text = sentinel.restore(&text, &generated);
    let text = sentinel.restore(&text, &inline);
    let text = sentinel.restore(&text, &display);

    NormalizedText(text)
}

/// Parks single-dollar spans: a `$` not preceded by `\`, a non-empty run
/// without `$`, then a `$` not preceded by `\`.
fn park_inline_math(text: &str, table: &mut PlaceholderTable, sentinel: Sentinel) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && (i == 0 || bytes[i - 1] != b'\\') {
            if let Some(offset) = text[i + 1..].find('$') {
                let close = i + 1 + offset;
                if offset > 0 && bytes[close - 1] != b'\\' {
                    out.push_str(&text[copied..i]);
                    out.push_str(&table.park(sentinel, text[i..=close].to_string()));
                    i = close + 1;
                    copied = i;
                    continue;
                }
            }
        }
        i += 1;
    }

    out.push_str(&text[copied..]);
    out
}

/// Converts bracket spans (`re` is the `\[` or `\(` pattern) whose body holds
/// an array and parks them, so the array passes don't fence the array again
/// inside its brackets.
fn park_bracketed_arrays(
    text: &str,
    re: &Regex,
    display: bool,
    table: &mut PlaceholderTable,
    sentinel: Sentinel,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut at = 0;

    while let Some(caps) = re.captures_at(text, at) {
        let whole = caps.get(0).expect("group 0 always matches");
        // `\\[2pt]` is a row break inside an array, not an opening bracket
        if text[..whole.start()].ends_with('\\') || !ARRAY_OPENER_RE.is_match(&caps[1]) {
            at = whole.start() + 1;
            continue;
        }
        let fenced = if display {
            pad_display(text, whole.start(), whole.end(), &format!("$${}$$", &caps[1]))
        } else {
            pad_inline(text, whole.start(), whole.end(), &format!("${}$", &caps[1]), sentinel)
        };
        out.push_str(&text[copied..whole.start()]);
        out.push_str(&table.park(sentinel, fenced));
        copied = whole.end();
        at = whole.end();
    }

    out.push_str(&text[copied..]);
    out
}

/// Wraps each match of `re` in display fencing and parks the result, so later
/// array and bracket passes can't match inside it again.
fn fence_arrays(
    text: &str,
    re: &Regex,
    table: &mut PlaceholderTable,
    sentinel: Sentinel,
) -> String {
    re.replace_all(text, |caps: &Captures| {
        let whole = caps.get(0).expect("group 0 always matches");
        let fenced = pad_display(
            text,
            whole.start(),
            whole.end(),
            &format!("$$\n{}\n$$", whole.as_str()),
        );
        table.park(sentinel, fenced)
    })
    .into_owned()
}

/// Display blocks get a newline on each side so the markdown parser sees them
/// apart from surrounding prose. No padding at the very start or end of text.
fn pad_display(text: &str, start: usize, end: usize, fenced: &str) -> String {
    let mut out = String::with_capacity(fenced.len() + 2);
    if start > 0 {
        out.push('\n');
    }
    out.push_str(fenced);
    if end < text.len() {
        out.push('\n');
    }
    out
}

/// Inline spans get a space on any side that would otherwise touch a `$`, a
/// parked span or the next `\(`.
fn pad_inline(text: &str, start: usize, end: usize, fenced: &str, sentinel: Sentinel) -> String {
    let touches = |c: Option<char>| matches!(c, Some(c) if c == '$' || c == sentinel.marker);
    let mut out = String::with_capacity(fenced.len() + 2);
    if touches(text[..start].chars().next_back()) {
        out.push(' ');
    }
    out.push_str(fenced);
    let rest = &text[end..];
    if touches(rest.chars().next()) || rest.starts_with(r"\(") {
        out.push(' ');
    }
    out
}
