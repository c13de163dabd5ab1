/*!
 Evaluated values and the expression evaluator.

 Property expressions stay raw token sequences until preprocessing; this
 module parses and evaluates them in one recursive-descent walk with the
 usual precedence ladder. `$`-prefixed references are delegated to a
 [`DollarResolver`] strategy so the reference-resolution pass can plug in a
 registry-backed implementation without touching the evaluator.
*/

use crate::diagnostics::{CompilerError, ErrorKind, Result, SourceLocation, Span};
use crate::lexer::unescape_string;
use crate::object_tree::{Literal, Value};
use crate::parser::{SyntaxKind, Token};
use crate::transaction::Transaction;
use indexmap::IndexMap;

/// A fully evaluated value: what transaction variables hold, what data
/// sources produce, and what expressions evaluate to.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<EvalValue>),
    Object(IndexMap<String, EvalValue>),
}

impl EvalValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            EvalValue::Null => false,
            EvalValue::Bool(b) => *b,
            EvalValue::Number(n) => *n != 0.0 && !n.is_nan(),
            EvalValue::String(s) => !s.is_empty(),
            EvalValue::Array(_) | EvalValue::Object(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EvalValue::Null => "null",
            EvalValue::Bool(_) => "boolean",
            EvalValue::Number(_) => "number",
            EvalValue::String(_) => "string",
            EvalValue::Array(_) => "array",
            EvalValue::Object(_) => "object",
        }
    }

    /// String form used by `+` concatenation
    pub fn to_display_string(&self) -> String {
        match self {
            EvalValue::Null => "null".into(),
            EvalValue::Bool(b) => b.to_string(),
            EvalValue::Number(n) => format_number(*n),
            EvalValue::String(s) => s.clone(),
            EvalValue::Array(_) | EvalValue::Object(_) => {
                serde_json::Value::from(self).to_string()
            }
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl From<serde_json::Value> for EvalValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => EvalValue::Null,
            serde_json::Value::Bool(b) => EvalValue::Bool(b),
            serde_json::Value::Number(n) => EvalValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => EvalValue::String(s),
            serde_json::Value::Array(a) => {
                EvalValue::Array(a.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(o) => {
                EvalValue::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&EvalValue> for serde_json::Value {
    fn from(v: &EvalValue) -> Self {
        match v {
            EvalValue::Null => serde_json::Value::Null,
            EvalValue::Bool(b) => serde_json::Value::Bool(*b),
            EvalValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            EvalValue::String(s) => serde_json::Value::String(s.clone()),
            EvalValue::Array(a) => serde_json::Value::Array(a.iter().map(Into::into).collect()),
            EvalValue::Object(o) => serde_json::Value::Object(
                o.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

pub fn literal_to_eval(literal: &Literal) -> EvalValue {
    match literal {
        Literal::String(s) => EvalValue::String(s.to_string()),
        Literal::Number(n) => EvalValue::Number(*n),
        Literal::Bool(b) => EvalValue::Bool(*b),
        Literal::Null => EvalValue::Null,
    }
}

/// The literal form of an already-evaluated tree value, or `None` if it
/// still contains an unevaluated expression at any nesting depth.
pub fn value_to_eval(value: &Value) -> Option<EvalValue> {
    match value {
        Value::Literal(l) => Some(literal_to_eval(l)),
        Value::Array(elements) => elements
            .iter()
            .map(value_to_eval)
            .collect::<Option<Vec<_>>>()
            .map(EvalValue::Array),
        Value::Expression(_) => None,
    }
}

/// Wrap an evaluated value back into a tree value. Objects have no literal
/// form and are stored as their JSON text.
pub fn eval_to_value(value: EvalValue) -> Value {
    match value {
        EvalValue::Null => Value::Literal(Literal::Null),
        EvalValue::Bool(b) => Value::Literal(Literal::Bool(b)),
        EvalValue::Number(n) => Value::Literal(Literal::Number(n)),
        EvalValue::String(s) => Value::Literal(Literal::String(s.into())),
        EvalValue::Array(a) => Value::Array(a.into_iter().map(eval_to_value).collect()),
        obj @ EvalValue::Object(_) => {
            Value::Literal(Literal::String(serde_json::Value::from(&obj).to_string().into()))
        }
    }
}

/// Cursor over a captured expression token sequence.
pub struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    base: SourceLocation,
}

impl<'a> TokenCursor<'a> {
    pub fn new(tokens: &'a [Token], base: SourceLocation) -> Self {
        Self { tokens, pos: 0, base }
    }

    pub fn peek_kind(&self) -> SyntaxKind {
        self.tokens.get(self.pos).map_or(SyntaxKind::Eof, |t| t.kind)
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    pub fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Location of the current token, falling back to the expression itself
    pub fn location(&self) -> SourceLocation {
        match self.tokens.get(self.pos).or_else(|| self.tokens.last()) {
            Some(t) => SourceLocation {
                source_file: self.base.source_file.clone(),
                span: Span::new(t.offset),
            },
            None => self.base.clone(),
        }
    }

    pub fn expect(&mut self, kind: SyntaxKind) -> Result<Token> {
        if self.peek_kind() != kind {
            return Err(CompilerError::new(
                ErrorKind::SyntaxError(format!(
                    "expected {kind} in expression, found {}",
                    self.peek_kind()
                )),
                self.location(),
            ));
        }
        Ok(self.next().unwrap().clone())
    }
}

/// Strategy for `$`-prefixed reference terms. The cursor is positioned at
/// the `$` token; the implementation consumes the whole reference.
pub trait DollarResolver {
    fn resolve(
        &self,
        cursor: &mut TokenCursor<'_>,
        evaluator: &ExpressionEvaluator<'_>,
    ) -> Result<EvalValue>;
}

/// The stage-1 strategy: any `$` reference is an error. Template expansion
/// runs with this installed; expressions containing `$` tokens are deferred
/// to the reference-resolution pass before evaluation is ever attempted.
pub struct UnresolvedDollar;

impl DollarResolver for UnresolvedDollar {
    fn resolve(
        &self,
        cursor: &mut TokenCursor<'_>,
        _: &ExpressionEvaluator<'_>,
    ) -> Result<EvalValue> {
        Err(CompilerError::new(ErrorKind::UnresolvedReference, cursor.location()))
    }
}

/// Recursive-descent evaluator over raw token sequences.
///
/// Precedence, lowest to highest: logical or, logical and, equality,
/// ordered comparison, additive, multiplicative, exponentiation
/// (right-associative), unary, primary.
pub struct ExpressionEvaluator<'a> {
    pub transaction: &'a Transaction,
    pub resolver: &'a dyn DollarResolver,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(transaction: &'a Transaction, resolver: &'a dyn DollarResolver) -> Self {
        Self { transaction, resolver }
    }

    pub fn evaluate(&self, tokens: &[Token], location: &SourceLocation) -> Result<EvalValue> {
        let mut cursor = TokenCursor::new(tokens, location.clone());
        let value = self.parse_expression(&mut cursor)?;
        if !cursor.at_end() {
            return Err(CompilerError::new(
                ErrorKind::SyntaxError(format!(
                    "unexpected {} after expression",
                    cursor.peek_kind()
                )),
                cursor.location(),
            ));
        }
        Ok(value)
    }

    /// Entry point usable from a [`DollarResolver`] for embedded
    /// sub-expressions such as index operands.
    pub fn parse_expression(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        self.parse_or(cursor)
    }

    fn parse_or(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_and(cursor)?;
        while cursor.peek_kind() == SyntaxKind::OrOr {
            cursor.next();
            if lhs.is_truthy() {
                // Short circuit: the operand tokens still have to be skipped
                self.skip_operand(cursor, Self::parse_and)?;
                lhs = EvalValue::Bool(true);
            } else {
                lhs = EvalValue::Bool(self.parse_and(cursor)?.is_truthy());
            }
        }
        Ok(lhs)
    }

    fn parse_and(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_equality(cursor)?;
        while cursor.peek_kind() == SyntaxKind::AndAnd {
            cursor.next();
            if !lhs.is_truthy() {
                self.skip_operand(cursor, Self::parse_equality)?;
                lhs = EvalValue::Bool(false);
            } else {
                lhs = EvalValue::Bool(self.parse_equality(cursor)?.is_truthy());
            }
        }
        Ok(lhs)
    }

    /// Evaluate-and-discard for the short-circuited side. Side effects are
    /// impossible in skipped operands because fetches happen earlier, so
    /// evaluation errors in dead branches are swallowed by parsing only.
    fn skip_operand(
        &self,
        cursor: &mut TokenCursor<'_>,
        parse: fn(&Self, &mut TokenCursor<'_>) -> Result<EvalValue>,
    ) -> Result<()> {
        match parse(self, cursor) {
            Ok(_) => Ok(()),
            // A dead operand may reference variables that are legitimately
            // unbound; only structural faults are reported.
            Err(e) if matches!(e.kind, ErrorKind::SyntaxError(_)) => Err(e),
            Err(_) => Ok(()),
        }
    }

    fn parse_equality(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_comparison(cursor)?;
        loop {
            let negated = match cursor.peek_kind() {
                SyntaxKind::EqualEqual => false,
                SyntaxKind::NotEqual => true,
                _ => return Ok(lhs),
            };
            cursor.next();
            let rhs = self.parse_comparison(cursor)?;
            // `==`/`!=` do not coerce
            lhs = EvalValue::Bool((lhs == rhs) != negated);
        }
    }

    fn parse_comparison(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_additive(cursor)?;
        loop {
            let op = cursor.peek_kind();
            if !matches!(
                op,
                SyntaxKind::LAngle
                    | SyntaxKind::RAngle
                    | SyntaxKind::LessEqual
                    | SyntaxKind::GreaterEqual
            ) {
                return Ok(lhs);
            }
            let location = cursor.location();
            cursor.next();
            let rhs = self.parse_additive(cursor)?;
            let l = to_number(&lhs, &location)?;
            let r = to_number(&rhs, &location)?;
            lhs = EvalValue::Bool(match op {
                SyntaxKind::LAngle => l < r,
                SyntaxKind::RAngle => l > r,
                SyntaxKind::LessEqual => l <= r,
                _ => l >= r,
            });
        }
    }

    fn parse_additive(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_multiplicative(cursor)?;
        loop {
            let op = cursor.peek_kind();
            if !matches!(op, SyntaxKind::Plus | SyntaxKind::Minus) {
                return Ok(lhs);
            }
            let location = cursor.location();
            cursor.next();
            let rhs = self.parse_multiplicative(cursor)?;
            lhs = match op {
                SyntaxKind::Plus => {
                    if matches!(lhs, EvalValue::String(_)) || matches!(rhs, EvalValue::String(_)) {
                        EvalValue::String(lhs.to_display_string() + &rhs.to_display_string())
                    } else {
                        EvalValue::Number(to_number(&lhs, &location)? + to_number(&rhs, &location)?)
                    }
                }
                _ => EvalValue::Number(to_number(&lhs, &location)? - to_number(&rhs, &location)?),
            };
        }
    }

    fn parse_multiplicative(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let mut lhs = self.parse_exponent(cursor)?;
        loop {
            let op = cursor.peek_kind();
            if !matches!(op, SyntaxKind::Star | SyntaxKind::Div | SyntaxKind::Percent) {
                return Ok(lhs);
            }
            let location = cursor.location();
            cursor.next();
            let rhs = self.parse_exponent(cursor)?;
            let l = to_number(&lhs, &location)?;
            let r = to_number(&rhs, &location)?;
            lhs = EvalValue::Number(match op {
                SyntaxKind::Star => l * r,
                SyntaxKind::Div => l / r,
                _ => l % r,
            });
        }
    }

    fn parse_exponent(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let lhs = self.parse_unary(cursor)?;
        if cursor.peek_kind() != SyntaxKind::StarStar {
            return Ok(lhs);
        }
        let location = cursor.location();
        cursor.next();
        // Right-associative
        let rhs = self.parse_exponent(cursor)?;
        Ok(EvalValue::Number(to_number(&lhs, &location)?.powf(to_number(&rhs, &location)?)))
    }

    fn parse_unary(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        match cursor.peek_kind() {
            SyntaxKind::Bang => {
                cursor.next();
                let operand = self.parse_unary(cursor)?;
                Ok(EvalValue::Bool(!operand.is_truthy()))
            }
            SyntaxKind::Minus => {
                let location = cursor.location();
                cursor.next();
                let operand = self.parse_unary(cursor)?;
                Ok(EvalValue::Number(-to_number(&operand, &location)?))
            }
            _ => self.parse_primary(cursor),
        }
    }

    fn parse_primary(&self, cursor: &mut TokenCursor<'_>) -> Result<EvalValue> {
        let location = cursor.location();
        match cursor.peek_kind() {
            SyntaxKind::NumberLiteral => {
                let t = cursor.next().unwrap();
                let n = t.as_str().parse::<f64>().map_err(|_| {
                    CompilerError::new(
                        ErrorKind::InvalidNumberConversion(t.as_str().into()),
                        location,
                    )
                })?;
                Ok(EvalValue::Number(n))
            }
            SyntaxKind::StringLiteral => {
                let t = cursor.next().unwrap();
                Ok(EvalValue::String(unescape_string(t.as_str())))
            }
            SyntaxKind::BoolLiteral => {
                let t = cursor.next().unwrap();
                Ok(EvalValue::Bool(t.as_str() == "true"))
            }
            SyntaxKind::NullLiteral => {
                cursor.next();
                Ok(EvalValue::Null)
            }
            SyntaxKind::LParent => {
                cursor.next();
                let value = self.parse_expression(cursor)?;
                cursor.expect(SyntaxKind::RParent)?;
                self.parse_member_chain(cursor, value)
            }
            SyntaxKind::Dollar => {
                let value = self.resolver.resolve(cursor, self)?;
                self.parse_member_chain(cursor, value)
            }
            SyntaxKind::Identifier => {
                let name = cursor.next().unwrap().text.clone();
                if cursor.peek_kind() == SyntaxKind::LParent {
                    let value = self.parse_call(cursor, &name, &location)?;
                    return self.parse_member_chain(cursor, value);
                }
                let value = self.transaction.variable(&name).ok_or_else(|| {
                    CompilerError::new(ErrorKind::UndefinedVariable(name.to_string()), location)
                })?;
                self.parse_member_chain(cursor, value)
            }
            other => Err(CompilerError::new(
                ErrorKind::SyntaxError(format!("unexpected {other} in expression")),
                location,
            )),
        }
    }

    fn parse_call(
        &self,
        cursor: &mut TokenCursor<'_>,
        name: &str,
        location: &SourceLocation,
    ) -> Result<EvalValue> {
        let function = self.transaction.function(name).ok_or_else(|| {
            CompilerError::new(ErrorKind::UndefinedVariable(name.to_string()), location.clone())
        })?;
        cursor.expect(SyntaxKind::LParent)?;
        let mut args = vec![];
        if cursor.peek_kind() != SyntaxKind::RParent {
            loop {
                args.push(self.parse_expression(cursor)?);
                if cursor.peek_kind() != SyntaxKind::Comma {
                    break;
                }
                cursor.next();
            }
        }
        cursor.expect(SyntaxKind::RParent)?;
        function(&args).map_err(|message| {
            CompilerError::new(
                ErrorKind::MacroError(format!("function '{name}' failed: {message}")),
                location.clone(),
            )
        })
    }

    /// `.field` chains for member access on evaluated values
    fn parse_member_chain(
        &self,
        cursor: &mut TokenCursor<'_>,
        mut value: EvalValue,
    ) -> Result<EvalValue> {
        while cursor.peek_kind() == SyntaxKind::Dot {
            let location = cursor.location();
            cursor.next();
            if cursor.peek_kind() != SyntaxKind::Identifier {
                return Err(CompilerError::new(ErrorKind::ExpectedPropertyName, location));
            }
            let field = cursor.next().unwrap().text.clone();
            value = match (&value, field.as_str()) {
                (EvalValue::Null, _) => {
                    return Err(CompilerError::new(
                        ErrorKind::NullPropertyAccess(field.to_string()),
                        location,
                    ));
                }
                (EvalValue::Array(a), "length") => EvalValue::Number(a.len() as f64),
                (EvalValue::String(s), "length") => EvalValue::Number(s.chars().count() as f64),
                (EvalValue::Object(o), _) => o.get(field.as_str()).cloned().unwrap_or(EvalValue::Null),
                _ => {
                    return Err(CompilerError::new(
                        ErrorKind::NullPropertyAccess(field.to_string()),
                        location,
                    ));
                }
            };
        }
        Ok(value)
    }
}

pub fn to_number(value: &EvalValue, location: &SourceLocation) -> Result<f64> {
    match value {
        EvalValue::Number(n) => Ok(*n),
        EvalValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        EvalValue::String(s) => s.trim().parse::<f64>().map_err(|_| {
            CompilerError::new(ErrorKind::InvalidNumberConversion(s.clone()), location.clone())
        }),
        other => Err(CompilerError::new(
            ErrorKind::InvalidNumberConversion(other.type_name().to_string()),
            location.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn eval(source: &str, txn: &Transaction) -> Result<EvalValue> {
        let tokens = crate::parser::lex(source).unwrap();
        let tokens: Vec<_> = tokens
            .into_iter()
            .filter(|t| !matches!(t.kind, SyntaxKind::Whitespace | SyntaxKind::Comment))
            .collect();
        ExpressionEvaluator::new(txn, &UnresolvedDollar)
            .evaluate(&tokens, &SourceLocation::default())
    }

    #[test]
    fn precedence_ladder() {
        let txn = Transaction::new();
        assert_eq!(eval("1 + 2 * 3", &txn).unwrap(), EvalValue::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3", &txn).unwrap(), EvalValue::Number(9.0));
        assert_eq!(eval("2 ** 3 ** 2", &txn).unwrap(), EvalValue::Number(512.0));
        assert_eq!(eval("10 % 4", &txn).unwrap(), EvalValue::Number(2.0));
        assert_eq!(eval("-2 ** 2", &txn).unwrap(), EvalValue::Number(4.0));
        assert_eq!(eval("1 + 1 == 2 && 3 < 4", &txn).unwrap(), EvalValue::Bool(true));
    }

    #[test]
    fn equality_does_not_coerce() {
        let txn = Transaction::new();
        assert_eq!(eval("1 == \"1\"", &txn).unwrap(), EvalValue::Bool(false));
        assert_eq!(eval("1 != \"1\"", &txn).unwrap(), EvalValue::Bool(true));
        assert_eq!(eval("\"a\" == \"a\"", &txn).unwrap(), EvalValue::Bool(true));
        assert_eq!(eval("null == null", &txn).unwrap(), EvalValue::Bool(true));
    }

    #[test]
    fn ordered_comparison_coerces_to_number() {
        let txn = Transaction::new();
        assert_eq!(eval("\"10\" > 9", &txn).unwrap(), EvalValue::Bool(true));
        let err = eval("\"abc\" > 1", &txn).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidNumberConversion(_)));
    }

    #[test]
    fn string_concatenation() {
        let txn = Transaction::new();
        assert_eq!(
            eval("\"n=\" + 4 + 1", &txn).unwrap(),
            EvalValue::String("n=41".into())
        );
        assert_eq!(eval("1 + 4 + \"!\"", &txn).unwrap(), EvalValue::String("5!".into()));
    }

    #[test]
    fn variables_and_member_access() {
        let txn = Transaction::new();
        txn.set_variable("w", EvalValue::Number(200.0));
        let mut user = IndexMap::new();
        user.insert("name".to_string(), EvalValue::String("ada".into()));
        txn.set_variable("user", EvalValue::Object(user));

        assert_eq!(eval("w + 40", &txn).unwrap(), EvalValue::Number(240.0));
        assert_eq!(eval("user.name", &txn).unwrap(), EvalValue::String("ada".into()));
        assert_eq!(eval("user.missing", &txn).unwrap(), EvalValue::Null);

        let err = eval("nope", &txn).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedVariable(ref n) if n == "nope"));
        let err = eval("user.missing.deeper", &txn).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NullPropertyAccess(_)));
    }

    #[test]
    fn array_length() {
        let txn = Transaction::new();
        txn.set_variable(
            "xs",
            EvalValue::Array(vec![EvalValue::Number(1.0), EvalValue::Number(2.0)]),
        );
        assert_eq!(eval("xs.length", &txn).unwrap(), EvalValue::Number(2.0));
    }

    #[test]
    fn host_functions() {
        let txn = Transaction::new();
        txn.register_function("max", |args| {
            let mut best = f64::NEG_INFINITY;
            for a in args {
                if let EvalValue::Number(n) = a {
                    best = best.max(*n);
                }
            }
            Ok(EvalValue::Number(best))
        });
        assert_eq!(eval("max(1, 7, 3) + 1", &txn).unwrap(), EvalValue::Number(8.0));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let txn = Transaction::new();
        txn.set_variable("yes", EvalValue::Bool(true));
        // `undefined` on the dead side must not fail
        assert_eq!(eval("yes || undefined", &txn).unwrap(), EvalValue::Bool(true));
        assert_eq!(eval("!yes && undefined", &txn).unwrap(), EvalValue::Bool(false));
        let err = eval("!yes || undefined", &txn).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedVariable(_)));
    }

    #[test]
    fn value_to_eval_rejects_nested_unresolved_expressions() {
        use crate::object_tree::{ExpressionValue, Value};

        let expr = Value::Expression(ExpressionValue {
            tokens: vec![],
            location: SourceLocation::default(),
        });
        let one = Value::Literal(crate::object_tree::Literal::Number(1.0));
        let nine = Value::Literal(crate::object_tree::Literal::Number(9.0));

        // An expression buried one level down poisons the whole value
        let nested = Value::Array(vec![Value::Array(vec![one.clone(), expr]), nine.clone()]);
        assert_eq!(value_to_eval(&nested), None);

        let clean = Value::Array(vec![Value::Array(vec![one]), nine]);
        assert_eq!(
            value_to_eval(&clean),
            Some(EvalValue::Array(vec![
                EvalValue::Array(vec![EvalValue::Number(1.0)]),
                EvalValue::Number(9.0),
            ]))
        );
    }

    #[test]
    fn dollar_reference_without_resolver_errors() {
        let txn = Transaction::new();
        let err = eval("$Sidebar.width", &txn).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnresolvedReference));
    }

    #[test]
    fn unary_and_trailing_dot() {
        let txn = Transaction::new();
        assert_eq!(eval("!0", &txn).unwrap(), EvalValue::Bool(true));
        assert_eq!(eval("--3", &txn).unwrap(), EvalValue::Number(3.0));
        let err = eval("\"a\" .", &txn);
        assert!(err.is_err());
    }
}
