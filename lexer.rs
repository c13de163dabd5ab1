//! This module contains the code for the lexer.
//!
//! It is kind of shared with parser.rs, which implements `lex_next_token`
//! based on the macro that declares the tokens.

/// This trait is used by the `crate::parser::lex_next_token` function and is
/// implemented for rules passed to the macro, which can be either a string
/// literal or a lexing function.
pub trait LexingRule {
    /// Return the size of the match for this rule, or 0 if there is no match
    fn lex(&self, text: &str) -> usize;
}

impl<'a> LexingRule for &'a str {
    #[inline]
    fn lex(&self, text: &str) -> usize {
        if text.starts_with(*self) {
            self.len()
        } else {
            0
        }
    }
}

impl<F: Fn(&str) -> usize> LexingRule for F {
    #[inline]
    fn lex(&self, text: &str) -> usize {
        (self)(text)
    }
}

pub fn lex_whitespace(text: &str) -> usize {
    let mut len = 0;
    for c in text.chars() {
        if !c.is_whitespace() {
            break;
        }
        len += c.len_utf8();
    }
    len
}

pub fn lex_comment(text: &str) -> usize {
    if text.starts_with("//") {
        return text.find(&['\n', '\r'] as &[_]).unwrap_or(text.len());
    }
    if text.starts_with("/*") {
        let mut nested = 0;
        let mut offset = 2;
        let bytes = text.as_bytes();
        while offset < bytes.len() {
            if let Some(star) = bytes[offset..].iter().position(|c| *c == b'*') {
                let star = star + offset;
                if star > offset && bytes[star - 1] == b'/' {
                    nested += 1;
                    offset = star + 1;
                } else if star < bytes.len() - 1 && bytes[star + 1] == b'/' {
                    if nested == 0 {
                        return star + 2;
                    }
                    nested -= 1;
                    offset = star + 2;
                } else {
                    offset = star + 1;
                }
            } else {
                // Unterminated
                return 0;
            }
        }
        return 0;
    }
    0
}

/// A free-text block opens with a run of three or more backticks and closes
/// when a run of exactly the same length recurs. Shorter runs inside are
/// literal content.
pub fn lex_free_text(text: &str) -> usize {
    let fence = text.chars().take_while(|c| *c == '`').count();
    if fence < 3 {
        return 0;
    }
    let bytes = text.as_bytes();
    let mut offset = fence;
    while offset < bytes.len() {
        if bytes[offset] == b'`' {
            let run = bytes[offset..].iter().take_while(|c| **c == b'`').count();
            if run == fence {
                return offset + run;
            }
            offset += run;
        } else {
            offset += 1;
        }
    }
    // Unterminated
    0
}

/// Strings use double or single quotes with `\n \t \r \\ \" \'` escapes.
pub fn lex_string(text: &str) -> usize {
    let quote = match text.chars().next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return 0,
    };
    let mut chars = text.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    // Unterminated escape
                    return 0;
                }
            }
            '\n' => return 0,
            c if c == quote => return i + 1,
            _ => {}
        }
    }
    // Unterminated
    0
}

pub fn lex_number(text: &str) -> usize {
    let mut len = 0;
    let mut had_period = false;
    for c in text.chars() {
        if !c.is_ascii_digit() {
            if !had_period && c == '.' && len > 0 {
                had_period = true;
            } else {
                break;
            }
        }
        len += c.len_utf8();
    }
    // A trailing period belongs to a dot chain, not the number
    if had_period && text.as_bytes().get(len - 1) == Some(&b'.') {
        return len - 1;
    }
    len
}

pub fn lex_identifier(text: &str) -> usize {
    let mut len = 0;
    for c in text.chars() {
        if len == 0 {
            if !c.is_alphabetic() && c != '_' {
                break;
            }
        } else if !c.is_alphanumeric() && c != '_' && c != '-' {
            break;
        }
        len += c.len_utf8();
    }
    len
}

/// Interpret the escape sequences of a lexed string token (quotes included).
pub fn unescape_string(token_text: &str) -> String {
    let inner = &token_text[1..token_text.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// The content of a free-text token, with the backtick fences stripped.
pub fn free_text_content(token_text: &str) -> &str {
    let fence = token_text.chars().take_while(|c| *c == '`').count();
    &token_text[fence..token_text.len() - fence]
}
