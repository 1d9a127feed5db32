//! Tokenizer for transformation snippets.
//!
//! Produces an indentation-aware token stream: NEWLINE ends a logical line,
//! INDENT/DEDENT bracket nested blocks, and line breaks inside brackets are
//! ignored.

use crate::error::ScriptError;

/// Operators, longest first so `//=` wins over `//` and `/`.
const SYMBOLS: [&str; 30] = [
    "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*", "/",
    "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Sym(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

fn syntax(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        line,
        message: message.into(),
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth: usize = 0;
    let mut line = 1;
    let mut i = 0;
    let mut at_line_start = true;

    while i < chars.len() {
        if at_line_start && depth == 0 {
            let mut width = 0;
            while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
                width += if chars[i] == '\t' { 4 } else { 1 };
                i += 1;
            }
            // blank and comment-only lines do not affect indentation
            if i >= chars.len() || chars[i] == '\n' || chars[i] == '#' || chars[i] == '\r' {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                if i < chars.len() {
                    i += 1;
                    line += 1;
                }
                continue;
            }

            let current = *indents.last().unwrap_or(&0);
            if width > current {
                indents.push(width);
                tokens.push(Token { tok: Tok::Indent, line });
            } else {
                while width < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    tokens.push(Token { tok: Tok::Dedent, line });
                }
                if width != *indents.last().unwrap_or(&0) {
                    return Err(syntax(line, "unindent does not match any outer indentation level"));
                }
            }
            at_line_start = false;
        }

        let c = chars[i];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Token { tok: Tok::Newline, line });
                    at_line_start = true;
                }
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line += 1;
                i += 2;
            }
            '"' | '\'' => {
                let (text, next, consumed_lines) = read_string(&chars, i, line)?;
                // adjacent literals concatenate
                if let Some(Token { tok: Tok::Str(prev), .. }) = tokens.last_mut() {
                    prev.push_str(&text);
                } else {
                    tokens.push(Token { tok: Tok::Str(text), line });
                }
                line += consumed_lines;
                i = next;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let (tok, next) = read_number(&chars, i, line)?;
                tokens.push(Token { tok, line });
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                tokens.push(Token { tok: Tok::Name(name), line });
            }
            _ => {
                let symbol = SYMBOLS
                    .iter()
                    .find(|sym| {
                        sym.chars()
                            .enumerate()
                            .all(|(offset, expected)| chars.get(i + offset) == Some(&expected))
                    })
                    .ok_or_else(|| syntax(line, format!("invalid character '{}'", c)))?;
                match *symbol {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => {
                        depth = depth
                            .checked_sub(1)
                            .ok_or_else(|| syntax(line, format!("unmatched '{}'", symbol)))?;
                    }
                    _ => {}
                }
                tokens.push(Token {
                    tok: Tok::Sym(symbol),
                    line,
                });
                i += symbol.len();
            }
        }
    }

    if depth > 0 {
        return Err(syntax(line, "unexpected end of input, unclosed bracket"));
    }
    if !matches!(tokens.last(), None | Some(Token { tok: Tok::Newline, .. })) {
        tokens.push(Token { tok: Tok::Newline, line });
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token { tok: Tok::Dedent, line });
    }
    tokens.push(Token { tok: Tok::Eof, line });
    Ok(tokens)
}

fn read_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize, usize), ScriptError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    let mut lines = 0;

    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((text, i + 1, lines)),
            '\n' => return Err(syntax(line, "unterminated string literal")),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| syntax(line, "unterminated string literal"))?;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\\' => text.push('\\'),
                    '\'' => text.push('\''),
                    '"' => text.push('"'),
                    '\n' => lines += 1,
                    other => {
                        text.push('\\');
                        text.push(*other);
                    }
                }
                i += 2;
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(syntax(line, "unterminated string literal"))
}

fn read_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), ScriptError> {
    let mut i = start;
    let mut is_float = false;

    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || c == '_' {
            i += 1;
        } else if c == '.' && !is_float && chars.get(i + 1) != Some(&'.') {
            is_float = true;
            i += 1;
        } else if (c == 'e' || c == 'E')
            && chars
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
        {
            is_float = true;
            i += 2;
        } else {
            break;
        }
    }

    let literal: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    if chars.get(i).is_some_and(|c| c.is_alphabetic() || *c == '_') {
        return Err(syntax(line, format!("invalid number literal '{}'", literal)));
    }

    let tok = if is_float {
        Tok::Float(
            literal
                .parse()
                .map_err(|_| syntax(line, format!("invalid number literal '{}'", literal)))?,
        )
    } else {
        match literal.parse::<i64>() {
            Ok(n) => Tok::Int(n),
            Err(_) => Tok::Float(
                literal
                    .parse()
                    .map_err(|_| syntax(line, format!("invalid number literal '{}'", literal)))?,
            ),
        }
    };
    Ok((tok, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_expression() {
        assert_eq!(
            kinds("len(data['people'])"),
            vec![
                Tok::Name("len".into()),
                Tok::Sym("("),
                Tok::Name("data".into()),
                Tok::Sym("["),
                Tok::Str("people".into()),
                Tok::Sym("]"),
                Tok::Sym(")"),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 1_000 3e2"),
            vec![
                Tok::Int(1),
                Tok::Float(2.5),
                Tok::Int(1000),
                Tok::Float(300.0),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_longest_symbol_wins() {
        assert_eq!(
            kinds("a //= 2 ** 3"),
            vec![
                Tok::Name("a".into()),
                Tok::Sym("//="),
                Tok::Int(2),
                Tok::Sym("**"),
                Tok::Int(3),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indentation_blocks() {
        let toks = kinds("for p in xs:\n    if p:\n        n += 1\nresult = n\n");
        let indents = toks.iter().filter(|t| **t == Tok::Indent).count();
        let dedents = toks.iter().filter(|t| **t == Tok::Dedent).count();
        assert_eq!(indents, 2);
        assert_eq!(dedents, 2);
        assert_eq!(toks.last(), Some(&Tok::Eof));
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let toks = kinds("x = [\n  1,\n  2,\n]\n");
        assert_eq!(toks.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!toks.contains(&Tok::Indent));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let toks = kinds("# header\n\nx = 1  # trailing\n\n");
        assert_eq!(
            toks,
            vec![
                Tok::Name("x".into()),
                Tok::Sym("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes_and_concatenation() {
        assert_eq!(
            kinds(r#"'a\'b' "c\n""#),
            vec![Tok::Str("a'bc\n".into()), Tok::Newline, Tok::Eof]
        );
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("(1, 2").is_err());
        assert!(tokenize("a ? b").is_err());
        assert!(tokenize("if x:\n        a = 1\n    b = 2\n").is_err());
    }
}
