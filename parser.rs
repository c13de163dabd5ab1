/*! The OX language parser

This module is responsible for turning a string into an object tree.

The parser is recursive descent and fails fast: the first syntax error aborts
with the location of the offending token. Property expressions are *not*
parsed here; their tokens are captured verbatim and evaluated during
preprocessing.

The submodules hold the actual parsing functions.
*/

use crate::diagnostics::{
    CompilerError, ErrorKind, Result, SourceFile, SourceFileInner, SourceLocation, Span, Spanned,
};
use crate::object_tree::Document;
use smol_str::SmolStr;
use std::fmt::Display;

mod block;
mod document;
mod template;

pub(crate) use block::parse_block;
pub(crate) use template::parse_template;

/// This macro is invoked once, to declare all token kinds. The purpose is to
/// declare each token together with its lexing rule in one place.
///
/// The rule can be either a string literal or a lexer function. The order of
/// tokens is important: the rules run in that order and the first match wins.
macro_rules! declare_tokens {
    ($($token:ident -> $rule:expr ,)*) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub enum SyntaxKind {
            Eof,
            $(
                $token,
            )*
            /// `true`/`false`, reclassified from Identifier
            BoolLiteral,
            /// `null`, reclassified from Identifier
            NullLiteral,
        }

        impl Display for SyntaxKind {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$token => {
                        if let Some(literal) = <dyn std::any::Any>::downcast_ref::<&str>(& $rule) {
                            return write!(f, "'{}'", literal)
                        }
                    })*
                    _ => ()
                }
                write!(f, "{:?}", self)
            }
        }

        /// Returns a pair of the matched token kind at the beginning of `text`, and its size
        pub fn lex_next_token(text: &str) -> Option<(usize, SyntaxKind)> {
            use crate::lexer::LexingRule;
            $(
                let len = ($rule).lex(text);
                if len > 0 {
                    return Some((len, SyntaxKind::$token));
                }
            )*
            None
        }
    };
}

declare_tokens! {
    Whitespace -> &crate::lexer::lex_whitespace,
    Comment -> &crate::lexer::lex_comment,
    FreeText -> &crate::lexer::lex_free_text,
    StringLiteral -> &crate::lexer::lex_string,
    NumberLiteral -> &crate::lexer::lex_number,
    Identifier -> &crate::lexer::lex_identifier,
    StarStar -> "**",
    LessEqual -> "<=",
    GreaterEqual -> ">=",
    EqualEqual -> "==",
    NotEqual -> "!=",
    OrOr -> "||",
    AndAnd -> "&&",
    CloseTag -> "</",
    LBrace -> "{",
    RBrace -> "}",
    LParent -> "(",
    RParent -> ")",
    LAngle -> "<",
    RAngle -> ">",
    LBracket -> "[",
    RBracket -> "]",
    Plus -> "+",
    Minus -> "-",
    Star -> "*",
    Div -> "/",
    Percent -> "%",
    Equal -> "=",
    Colon -> ":",
    Comma -> ",",
    Dot -> ".",
    Bang -> "!",
    Dollar -> "$",
    At -> "@",
    Hash -> "#",
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: SyntaxKind,
    pub text: SmolStr,
    pub offset: usize,
}

impl Default for Token {
    fn default() -> Self {
        Token { kind: SyntaxKind::Eof, text: Default::default(), offset: usize::MAX }
    }
}

impl Token {
    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    pub fn kind(&self) -> SyntaxKind {
        self.kind
    }
}

/// Lex the whole source into a token vector, reclassifying the `true`,
/// `false` and `null` keywords. Trivia (whitespace, comments) is kept; the
/// parser skips it.
pub fn lex(source: &str) -> std::result::Result<Vec<Token>, (ErrorKind, usize)> {
    let mut result = vec![];
    let mut offset = 0;
    let mut rest = source;
    while !rest.is_empty() {
        if let Some((len, kind)) = lex_next_token(rest) {
            let kind = match (kind, &rest[..len]) {
                (SyntaxKind::Identifier, "true" | "false") => SyntaxKind::BoolLiteral,
                (SyntaxKind::Identifier, "null") => SyntaxKind::NullLiteral,
                (kind, _) => kind,
            };
            result.push(Token { kind, text: rest[..len].into(), offset });
            offset += len;
            rest = &rest[len..];
        } else {
            let c = rest.chars().next().unwrap();
            let kind = match c {
                '"' | '\'' => ErrorKind::UnterminatedString,
                '`' if rest.chars().take_while(|c| *c == '`').count() >= 3 => {
                    ErrorKind::UnterminatedFreeText
                }
                c => ErrorKind::UnexpectedCharacter(c),
            };
            return Err((kind, offset));
        }
    }
    Ok(result)
}

/// The token cursor shared by all parsing functions.
pub struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    pub source_file: SourceFile,
}

impl Parser {
    fn from_tokens(tokens: Vec<Token>, source_file: SourceFile) -> Self {
        Self { tokens, cursor: 0, source_file }
    }

    fn skip_trivia(&mut self) {
        while matches!(
            self.tokens.get(self.cursor).map(|t| t.kind),
            Some(SyntaxKind::Whitespace | SyntaxKind::Comment)
        ) {
            self.cursor += 1;
        }
    }

    /// Same as `nth(0)`
    pub fn peek(&mut self) -> Token {
        self.nth(0)
    }

    /// Peek the `n`th token, not including whitespace and comments
    pub fn nth(&mut self, mut n: usize) -> Token {
        self.skip_trivia();
        let mut c = self.cursor;
        while n > 0 {
            n -= 1;
            c += 1;
            while matches!(
                self.tokens.get(c).map(|t| t.kind),
                Some(SyntaxKind::Whitespace | SyntaxKind::Comment)
            ) {
                c += 1;
            }
        }
        self.tokens.get(c).cloned().unwrap_or_default()
    }

    /// Consume and return the current token
    pub fn consume(&mut self) -> Token {
        self.skip_trivia();
        let t = self.tokens.get(self.cursor).cloned().unwrap_or_default();
        if t.kind != SyntaxKind::Eof {
            self.cursor += 1;
        }
        t
    }

    /// Consume the token if it has the right kind, otherwise fail with a
    /// syntax error naming the expectation.
    pub fn expect(&mut self, kind: SyntaxKind) -> Result<Token> {
        if self.peek().kind() != kind {
            let found = self.peek().kind();
            return Err(self.error(format!("expected {kind}, found {found}")));
        }
        Ok(self.consume())
    }

    /// If the token is of this kind, consume it and return true
    pub fn test(&mut self, kind: SyntaxKind) -> bool {
        if self.peek().kind() != kind {
            return false;
        }
        self.consume();
        true
    }

    /// A syntax error at the current token location
    pub fn error(&mut self, message: impl Into<String>) -> CompilerError {
        let location = self.current_location();
        CompilerError::new(ErrorKind::SyntaxError(message.into()), location)
    }

    pub fn error_at(&self, kind: ErrorKind, token: &Token) -> CompilerError {
        CompilerError::new(kind, self.token_location(token))
    }

    pub fn token_location(&self, token: &Token) -> SourceLocation {
        SourceLocation {
            source_file: Some(self.source_file.clone()),
            span: Span::new(token.offset),
        }
    }

    pub fn current_location(&mut self) -> SourceLocation {
        let token = self.peek();
        self.token_location(&token)
    }
}

impl Spanned for Parser {
    fn span(&self) -> Span {
        Span::new(self.tokens.get(self.cursor).map_or(usize::MAX, |t| t.offset))
    }

    fn source_file(&self) -> Option<&SourceFile> {
        Some(&self.source_file)
    }
}

/// Parse a whole source string into a raw document tree.
pub fn parse(source: String, path: Option<&std::path::Path>) -> Result<Document> {
    let source_file = std::rc::Rc::new(SourceFileInner::new(
        path.map(crate::pathutils::clean_path).unwrap_or_default(),
        source,
    ));
    let tokens = lex(source_file.source().unwrap()).map_err(|(kind, offset)| {
        CompilerError::new(
            kind,
            SourceLocation { source_file: Some(source_file.clone()), span: Span::new(offset) },
        )
    })?;
    let mut p = Parser::from_tokens(tokens, source_file);
    document::parse_document(&mut p)
}
