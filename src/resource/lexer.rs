//! Tokenizer for resource expressions.

use super::{ResourceError, ResourceResult};

/// Token kinds produced by [`tokenize`].
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    /// Operators that lex fine but have no place in the language
    /// (`=`, `&`, `|`, `^`, `~`, `<<`, `>>`, `@`).
    Unsupported(&'static str),
    Eof,
}

/// A token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

/// Splits `source` into tokens, always ending with [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> ResourceResult<Vec<Token>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let (offset, c) = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].1.is_ascii_alphanumeric() || chars[pos].1 == '_')
            {
                pos += 1;
            }
            let name: String = chars[start..pos].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Name(name),
                offset,
            });
            continue;
        }

        if c.is_ascii_digit() {
            let (kind, next) = lex_number(&chars, pos)?;
            tokens.push(Token { kind, offset });
            pos = next;
            continue;
        }

        if c == '\'' || c == '"' {
            let (value, next) = lex_string(&chars, pos)?;
            tokens.push(Token {
                kind: TokenKind::Str(value),
                offset,
            });
            pos = next;
            continue;
        }

        let peek = chars.get(pos + 1).map(|(_, c)| *c);
        let (kind, width) = match (c, peek) {
            ('*', Some('*')) => (TokenKind::DoubleStar, 2),
            ('/', Some('/')) => (TokenKind::DoubleSlash, 2),
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::LtE, 2),
            ('>', Some('=')) => (TokenKind::GtE, 2),
            ('<', Some('<')) => (TokenKind::Unsupported("<<"), 2),
            ('>', Some('>')) => (TokenKind::Unsupported(">>"), 2),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('.', _) => (TokenKind::Dot, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('=', _) => (TokenKind::Unsupported("="), 1),
            ('&', _) => (TokenKind::Unsupported("&"), 1),
            ('|', _) => (TokenKind::Unsupported("|"), 1),
            ('^', _) => (TokenKind::Unsupported("^"), 1),
            ('~', _) => (TokenKind::Unsupported("~"), 1),
            ('@', _) => (TokenKind::Unsupported("@"), 1),
            _ => {
                return Err(ResourceError::Syntax {
                    offset,
                    message: format!("unexpected character {:?}", c),
                });
            }
        };
        tokens.push(Token { kind, offset });
        pos += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: source.len(),
    });
    Ok(tokens)
}

fn lex_number(chars: &[(usize, char)], start: usize) -> ResourceResult<(TokenKind, usize)> {
    let offset = chars[start].0;
    let mut pos = start;

    // Prefixed integers: 0x.., 0o.., 0b..
    if chars[pos].1 == '0'
        && let Some(&(_, marker)) = chars.get(pos + 1)
        && let Some(radix) = match marker.to_ascii_lowercase() {
            'x' => Some(16),
            'o' => Some(8),
            'b' => Some(2),
            _ => None,
        }
    {
        pos += 2;
        let digits_start = pos;
        while pos < chars.len() && (chars[pos].1.is_ascii_alphanumeric() || chars[pos].1 == '_') {
            pos += 1;
        }
        let digits: String = chars[digits_start..pos]
            .iter()
            .map(|(_, c)| *c)
            .filter(|c| *c != '_')
            .collect();
        let value = i64::from_str_radix(&digits, radix).map_err(|e| ResourceError::Syntax {
            offset,
            message: format!("invalid integer literal: {}", e),
        })?;
        return Ok((TokenKind::Int(value), pos));
    }

    let mut is_float = false;
    while pos < chars.len() {
        let c = chars[pos].1;
        if c.is_ascii_digit() || c == '_' {
            pos += 1;
        } else if c == '.' && !is_float {
            // `1.` followed by a name is an attribute access on a number; not
            // allowed anyway, but keep the dot for the parser to reject.
            if chars
                .get(pos + 1)
                .is_some_and(|(_, n)| n.is_ascii_alphabetic() || *n == '_')
            {
                break;
            }
            is_float = true;
            pos += 1;
        } else if (c == 'e' || c == 'E')
            && chars.get(pos + 1).is_some_and(|(_, n)| {
                n.is_ascii_digit()
                    || ((*n == '+' || *n == '-')
                        && chars.get(pos + 2).is_some_and(|(_, d)| d.is_ascii_digit()))
            })
        {
            is_float = true;
            pos += 2;
        } else {
            break;
        }
    }

    let text: String = chars[start..pos]
        .iter()
        .map(|(_, c)| *c)
        .filter(|c| *c != '_')
        .collect();
    let kind = if is_float {
        TokenKind::Float(text.parse().map_err(|e| ResourceError::Syntax {
            offset,
            message: format!("invalid float literal: {}", e),
        })?)
    } else {
        TokenKind::Int(text.parse().map_err(|e| ResourceError::Syntax {
            offset,
            message: format!("invalid integer literal: {}", e),
        })?)
    };
    Ok((kind, pos))
}

fn lex_string(chars: &[(usize, char)], start: usize) -> ResourceResult<(String, usize)> {
    let (offset, quote) = chars[start];
    let mut pos = start + 1;
    let mut value = String::new();

    while pos < chars.len() {
        let c = chars[pos].1;
        if c == quote {
            return Ok((value, pos + 1));
        }
        if c == '\n' {
            break;
        }
        if c == '\\' {
            let Some(&(_, escaped)) = chars.get(pos + 1) else {
                break;
            };
            match escaped {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                '0' => value.push('\0'),
                '\\' => value.push('\\'),
                '\'' => value.push('\''),
                '"' => value.push('"'),
                other => {
                    value.push('\\');
                    value.push(other);
                }
            }
            pos += 2;
            continue;
        }
        value.push(c);
        pos += 1;
    }

    Err(ResourceError::Syntax {
        offset,
        message: "unterminated string literal".to_string(),
    })
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
            kinds("package.name == 'fwts'"),
            vec![
                TokenKind::Name("package".into()),
                TokenKind::Dot,
                TokenKind::Name("name".into()),
                TokenKind::EqEq,
                TokenKind::Str("fwts".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_numbers() {
        assert_eq!(
            kinds("10 2.5 1e3 0x1f 1_000"),
            vec![
                TokenKind::Int(10),
                TokenKind::Float(2.5),
                TokenKind::Float(1000.0),
                TokenKind::Int(31),
                TokenKind::Int(1000),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n" 'it\'s'"#),
            vec![
                TokenKind::Str("a\"b\n".into()),
                TokenKind::Str("it's".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_two_char_operators() {
        assert_eq!(
            kinds("a // b ** c != d <= e >= f"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::DoubleSlash,
                TokenKind::Name("b".into()),
                TokenKind::DoubleStar,
                TokenKind::Name("c".into()),
                TokenKind::NotEq,
                TokenKind::Name("d".into()),
                TokenKind::LtE,
                TokenKind::Name("e".into()),
                TokenKind::GtE,
                TokenKind::Name("f".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("x.a == 'oops").unwrap_err();
        assert!(matches!(err, ResourceError::Syntax { offset: 7, .. }));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(tokenize("x.a == $").is_err());
    }

    #[test]
    fn test_bitwise_operators_are_flagged() {
        assert_eq!(kinds("a & b")[1], TokenKind::Unsupported("&"));
    }
}
