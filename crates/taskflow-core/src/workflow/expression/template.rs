//! `${...}` interpolation inside string values.
//!
//! A string that is exactly one `${expr}` evaluates to the expression's
//! typed value; anything else renders to a string with each expression
//! spliced in. `$${` escapes a literal `${`.

use super::parser::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    /// Expression source and its byte offset inside the template.
    Expr { source: String, offset: usize },
}

/// Split a template string into literal text and expression segments.
pub(crate) fn segments(template: &str) -> Result<Vec<Segment>, ParseError> {
    let bytes = template.as_bytes();
    let mut out = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && template[i..].starts_with("$${") {
            text.push_str("${");
            i += 3;
            continue;
        }
        if bytes[i] == b'$' && template[i..].starts_with("${") {
            let start = i + 2;
            let end = closing_brace(template, start).ok_or_else(|| ParseError {
                position: i,
                message: "unterminated '${' in template".to_string(),
            })?;
            if !text.is_empty() {
                out.push(Segment::Text(std::mem::take(&mut text)));
            }
            out.push(Segment::Expr {
                source: template[start..end].to_string(),
                offset: start,
            });
            i = end + 1;
            continue;
        }
        // Copy one full UTF-8 character.
        let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
        text.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }

    if !text.is_empty() {
        out.push(Segment::Text(text));
    }
    Ok(out)
}

/// Whether the string contains any interpolation at all.
pub(crate) fn has_interpolation(value: &str) -> bool {
    value.contains("${")
}

/// Byte index of the `}` closing an interpolation opened before `start`,
/// skipping braces inside quoted strings and nested `{}` pairs.
fn closing_brace(template: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, ch) in template[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(start + offset),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        assert_eq!(
            segments("hello").unwrap(),
            vec![Segment::Text("hello".to_string())]
        );
        assert!(segments("").unwrap().is_empty());
    }

    #[test]
    fn test_single_expression() {
        assert_eq!(
            segments("${input.url}").unwrap(),
            vec![Segment::Expr {
                source: "input.url".to_string(),
                offset: 2
            }]
        );
    }

    #[test]
    fn test_mixed_segments_and_quoted_brace() {
        let parts = segments("id=${concat('}', x)}; done").unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts[1],
            Segment::Expr {
                source: "concat('}', x)".to_string(),
                offset: 5
            }
        );
        assert_eq!(parts[2], Segment::Text("; done".to_string()));
    }

    #[test]
    fn test_escape_and_unicode() {
        assert_eq!(
            segments("costs $${x} – €").unwrap(),
            vec![Segment::Text("costs ${x} – €".to_string())]
        );
    }

    #[test]
    fn test_unterminated() {
        let err = segments("a ${input.x").unwrap_err();
        assert_eq!(err.position, 2);
    }
}
