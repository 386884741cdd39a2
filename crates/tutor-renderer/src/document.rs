//! Standalone HTML page around a rendered answer.

use std::path::PathBuf;

use miette::IntoDiagnostic;
use pulldown_cmark_escape::escape_html;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const MATHJAX_CDN: &str = "https://cdn.jsdelivr.net/npm/mathjax@3/es5/tex-mml-chtml.js";

/// Makes MathJax pick up the same `$`/`$$` fencing the normalizer emits.
const MATHJAX_CONFIG: &str = r#"  <script>
    window.MathJax = {
      tex: {
        inlineMath: [['$', '$']],
        displayMath: [['$$', '$$']],
        processEscapes: true
      }
    };
  </script>
"#;

const ANSWER_CSS: &str = r#"  <style>
    .answer { max-width: 48rem; margin: 0 auto; line-height: 2; }
    .answer p { margin-bottom: 1rem; overflow-wrap: break-word; }
    .math-display { display: block; margin: 1.5rem 0; overflow-x: auto; overflow-y: hidden; text-align: center; }
    .math-inline { margin: 0 0.25rem; }
    .math-error { color: #b91c1c; }
  </style>
"#;

/// Where the page loads its client-side typesetter from, if anywhere.
#[derive(Debug, Clone, Default)]
pub enum MathScript {
    /// Math was typeset before writing, no script needed.
    #[default]
    None,
    MathJaxCdn,
    /// Directory holding `tex-mml-chtml.js`.
    MathJaxLocal(PathBuf),
}

pub async fn write_document_head(
    writer: &mut (impl AsyncWrite + Unpin),
    title: &str,
    math: &MathScript,
) -> miette::Result<()> {
    let mut escaped_title = String::new();
    let _ = escape_html(&mut escaped_title, title);

    writer.write_all(b"<!DOCTYPE html>\n").await.into_diagnostic()?;
    writer.write_all(b"<html>\n").await.into_diagnostic()?;
    writer.write_all(b"<head>\n").await.into_diagnostic()?;
    writer.write_all(b"  <meta charset=\"utf-8\">\n").await.into_diagnostic()?;
    writer
        .write_all(b"  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n")
        .await
        .into_diagnostic()?;
    writer
        .write_all(format!("  <title>{escaped_title}</title>\n").as_bytes())
        .await
        .into_diagnostic()?;
    writer.write_all(ANSWER_CSS.as_bytes()).await.into_diagnostic()?;

    match math {
        MathScript::None => {}
        MathScript::MathJaxCdn => {
            writer.write_all(MATHJAX_CONFIG.as_bytes()).await.into_diagnostic()?;
            writer
                .write_all(format!("  <script defer src=\"{MATHJAX_CDN}\"></script>\n").as_bytes())
                .await
                .into_diagnostic()?;
        }
        MathScript::MathJaxLocal(path) => {
            let path_str = path.to_string_lossy();
            writer.write_all(MATHJAX_CONFIG.as_bytes()).await.into_diagnostic()?;
            writer
                .write_all(
                    format!("  <script defer src=\"{path_str}/tex-mml-chtml.js\"></script>\n")
                        .as_bytes(),
                )
                .await
                .into_diagnostic()?;
        }
    }

    writer.write_all(b"</head>\n").await.into_diagnostic()?;
    writer.write_all(b"<body>\n").await.into_diagnostic()?;
    writer.write_all(b"<div class=\"answer\">\n").await.into_diagnostic()?;

    Ok(())
}

pub async fn write_document_footer(writer: &mut (impl AsyncWrite + Unpin)) -> miette::Result<()> {
    writer.write_all(b"</div>\n").await.into_diagnostic()?;
    writer.write_all(b"</body>\n").await.into_diagnostic()?;
    writer.write_all(b"</html>\n").await.into_diagnostic()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn head(title: &str, math: MathScript) -> String {
        let mut out = Vec::new();
        write_document_head(&mut out, title, &math).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn title_is_escaped() {
        let output = head("a < b", MathScript::None).await;
        assert!(output.contains("<title>a &lt; b</title>"));
    }

    #[tokio::test]
    async fn no_script_when_pre_typeset() {
        let output = head("Answer", MathScript::None).await;
        assert!(!output.contains("<script"));
        assert!(output.contains(".math-display"));
    }

    #[tokio::test]
    async fn cdn_script_is_configured_for_dollar_fencing() {
        let output = head("Answer", MathScript::MathJaxCdn).await;
        assert!(output.contains("inlineMath: [['$', '$']]"));
        assert!(output.contains(MATHJAX_CDN));
    }

    #[tokio::test]
    async fn local_script_uses_given_directory() {
        let output = head("Answer", MathScript::MathJaxLocal(PathBuf::from("/assets/mathjax"))).await;
        assert!(output.contains("src=\"/assets/mathjax/tex-mml-chtml.js\""));
    }

    #[tokio::test]
    async fn footer_closes_document() {
        let mut out = Vec::new();
        write_document_footer(&mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "</div>\n</body>\n</html>\n");
    }
}
