use super::parser::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Int(i128),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Dot,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

// Longest operators first so `**` wins over `*`.
const OPERATORS: [&str; 19] = [
    "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "+", "-", "*", "/", "%", "&", "|", "^", "~",
    "<", ">",
];

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ',' => Some(TokenKind::Comma),
            '≤' => Some(TokenKind::Op("<=")),
            '≥' => Some(TokenKind::Op(">=")),
            '≠' => Some(TokenKind::Op("!=")),
            '.' if !chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit()) => {
                Some(TokenKind::Dot)
            }
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token { kind, pos });
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let (kind, next) = number(src, &chars, i)?;
            tokens.push(Token { kind, pos });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(ident),
                pos,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let (s, next) = string(&chars, i)?;
            tokens.push(Token {
                kind: TokenKind::Str(s),
                pos,
            });
            i = next;
            continue;
        }

        let rest = &src[pos..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token {
                    kind: TokenKind::Op(*op),
                    pos,
                });
                i += op.len();
            }
            None => {
                return Err(ParseError {
                    message: format!("unexpected character '{c}'"),
                    pos,
                })
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::End,
        pos: src.len(),
    });
    Ok(tokens)
}

fn number(
    src: &str,
    chars: &[(usize, char)],
    start: usize,
) -> Result<(TokenKind, usize), ParseError> {
    let pos = chars[start].0;
    let mut i = start;
    let radix = match (chars.get(i).map(|c| c.1), chars.get(i + 1).map(|c| c.1)) {
        (Some('0'), Some('x' | 'X')) => 16,
        (Some('0'), Some('b' | 'B')) => 2,
        (Some('0'), Some('o' | 'O')) => 8,
        _ => 10,
    };

    if radix != 10 {
        i += 2;
        let digits_start = i;
        while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
            i += 1;
        }
        let digits: String = chars[digits_start..i]
            .iter()
            .map(|(_, c)| *c)
            .filter(|c| *c != '_')
            .collect();
        return i128::from_str_radix(&digits, radix)
            .map(|v| (TokenKind::Int(v), i))
            .map_err(|_| ParseError {
                message: format!("invalid number literal '{}'", &src[pos..end_of(chars, i, src)]),
                pos,
            });
    }

    let mut is_float = false;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() || c == '_' {
            i += 1;
        } else if c == '.' && !is_float {
            is_float = true;
            i += 1;
        } else if (c == 'e' || c == 'E')
            && chars
                .get(i + 1)
                .is_some_and(|(_, n)| n.is_ascii_digit() || *n == '+' || *n == '-')
        {
            is_float = true;
            i += 2;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            break;
        } else {
            break;
        }
    }

    let text: String = src[pos..end_of(chars, i, src)]
        .chars()
        .filter(|c| *c != '_')
        .collect();
    let kind = if is_float {
        text.parse::<f64>().map(TokenKind::Float).ok()
    } else {
        text.parse::<i128>().map(TokenKind::Int).ok()
    };
    kind.map(|k| (k, i)).ok_or_else(|| ParseError {
        message: format!("invalid number literal '{text}'"),
        pos,
    })
}

fn end_of(chars: &[(usize, char)], i: usize, src: &str) -> usize {
    chars.get(i).map_or(src.len(), |(p, _)| *p)
}

fn string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), ParseError> {
    let (pos, quote) = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            i += 1;
            match chars.get(i).map(|c| c.1) {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some(other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
        i += 1;
    }
    Err(ParseError {
        message: "unterminated string".to_string(),
        pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_numbers() {
        assert_eq!(
            kinds("2**3 // 0x10 <= 1.5e2"),
            vec![
                TokenKind::Int(2),
                TokenKind::Op("**"),
                TokenKind::Int(3),
                TokenKind::Op("//"),
                TokenKind::Int(16),
                TokenKind::Op("<="),
                TokenKind::Float(150.0),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn dotted_names() {
        assert_eq!(
            kinds("raw.volts"),
            vec![
                TokenKind::Ident("raw".into()),
                TokenKind::Dot,
                TokenKind::Ident("volts".into()),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn unicode_comparisons() {
        assert_eq!(
            kinds("x ≥ 1"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Op(">="),
                TokenKind::Int(1),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn bad_character() {
        assert!(tokenize("a $ b").is_err());
    }
}
