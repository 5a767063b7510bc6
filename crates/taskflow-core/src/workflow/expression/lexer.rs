//! Tokenizer for the expression language.

use serde_json::Number;

/// A lexical token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(Number),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Undefined,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Str(s) => format!("string '{s}'"),
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::Null => "null",
            TokenKind::Undefined => "undefined",
            TokenKind::In => "in",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Question => "?",
            TokenKind::Colon => ":",
            TokenKind::Bang => "!",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Number(_) | TokenKind::Str(_) | TokenKind::Ident(_) | TokenKind::Eof => "",
        }
    }
}

/// Lexing failure: byte offset plus message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LexError {
    pub position: usize,
    pub message: String,
}

/// Split an expression into tokens. Always ends with `Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            // A dot only belongs to the number when a digit follows, so
            // `items.0` style access is not mistaken for a float.
            if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                let mut j = i + 1;
                if j < chars.len() && matches!(chars[j].1, '+' | '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].1.is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            let number = parse_number(&text, is_float).ok_or_else(|| LexError {
                position: pos,
                message: format!("invalid number literal '{text}'"),
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(number),
                position: pos,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            let kind = match word.as_str() {
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" => TokenKind::Null,
                "undefined" => TokenKind::Undefined,
                "in" => TokenKind::In,
                _ => TokenKind::Ident(word),
            };
            tokens.push(Token {
                kind,
                position: pos,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i].1;
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                if ch == '\\' {
                    i += 1;
                    let Some(&(_, escaped)) = chars.get(i) else {
                        break;
                    };
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                    i += 1;
                    continue;
                }
                value.push(ch);
                i += 1;
            }
            if !closed {
                return Err(LexError {
                    position: pos,
                    message: "unterminated string literal".to_string(),
                });
            }
            tokens.push(Token {
                kind: TokenKind::Str(value),
                position: pos,
            });
            continue;
        }

        let next = chars.get(i + 1).map(|(_, ch)| *ch);
        let (kind, width) = match (c, next) {
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::LtEq, 2),
            ('>', Some('=')) => (TokenKind::GtEq, 2),
            ('&', Some('&')) => (TokenKind::AndAnd, 2),
            ('|', Some('|')) => (TokenKind::OrOr, 2),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('!', _) => (TokenKind::Bang, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('.', _) => (TokenKind::Dot, 1),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('=', _) => {
                return Err(LexError {
                    position: pos,
                    message: "assignment is not supported; use '==' for comparison".to_string(),
                });
            }
            _ => {
                return Err(LexError {
                    position: pos,
                    message: format!("unexpected character '{c}'"),
                });
            }
        };
        tokens.push(Token {
            kind,
            position: pos,
        });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: source.len(),
    });
    Ok(tokens)
}

fn parse_number(text: &str, is_float: bool) -> Option<Number> {
    if !is_float {
        if let Ok(n) = text.parse::<i64>() {
            return Some(Number::from(n));
        }
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            kinds("state.count >= 10"),
            vec![
                TokenKind::Ident("state".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("count".to_string()),
                TokenKind::GtEq,
                TokenKind::Number(Number::from(10)),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_and_escapes() {
        assert_eq!(
            kinds(r#"'it\'s' "a\"b""#),
            vec![
                TokenKind::Str("it's".to_string()),
                TokenKind::Str("a\"b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_float_and_index() {
        let tokens = kinds("1.5 + items.0");
        assert!(matches!(&tokens[0], TokenKind::Number(n) if n.as_f64() == Some(1.5)));
        assert_eq!(tokens[3], TokenKind::Dot);
        assert_eq!(tokens[4], TokenKind::Number(Number::from(0)));
    }

    #[test]
    fn test_tokenize_keywords() {
        assert_eq!(
            kinds("true && !undefined || x in y"),
            vec![
                TokenKind::True,
                TokenKind::AndAnd,
                TokenKind::Bang,
                TokenKind::Undefined,
                TokenKind::OrOr,
                TokenKind::Ident("x".to_string()),
                TokenKind::In,
                TokenKind::Ident("y".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_errors_report_position() {
        let err = tokenize("a = 1").unwrap_err();
        assert_eq!(err.position, 2);
        assert!(err.message.contains("=="), "got: {}", err.message);

        let err = tokenize("'open").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = tokenize("a # b").unwrap_err();
        assert!(err.message.contains("'#'"));
    }
}
