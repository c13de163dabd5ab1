use super::block::{parse_block, parse_value};
use super::{Parser, SyntaxKind, Token};
use crate::diagnostics::Result;
use crate::lexer::unescape_string;
use crate::object_tree::{
    ExpressionValue, ForeachNode, IfNode, ImportNode, InjectNode, Node, OnDataNode, SetNode,
    Value, WhileNode,
};
use smol_str::SmolStr;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum TemplatePosition {
    TopLevel,
    BlockChild,
}

/// Parse a `<keyword ...>` construct. On entry the current token is `<`.
pub fn parse_template(p: &mut Parser, position: TemplatePosition) -> Result<Node> {
    let open = p.expect(SyntaxKind::LAngle)?;
    let location = p.token_location(&open);
    let keyword = p.expect(SyntaxKind::Identifier)?;

    match keyword.as_str() {
        "set" => {
            let name = p.expect(SyntaxKind::Identifier)?.text;
            p.expect(SyntaxKind::Equal)?;
            let value = parse_set_value(p)?;
            p.expect(SyntaxKind::RAngle)?;
            Ok(SetNode { name, value, location }.into())
        }
        "if" => {
            let condition = capture_condition(p)?;
            p.expect(SyntaxKind::RAngle)?;
            let (then_body, mut stop) = parse_body(p, "if", &["elseif", "else"])?;
            let mut elseifs = vec![];
            let mut else_body = vec![];
            while stop.as_deref() == Some("elseif") {
                p.expect(SyntaxKind::LAngle)?;
                p.expect(SyntaxKind::Identifier)?;
                let cond = capture_condition(p)?;
                p.expect(SyntaxKind::RAngle)?;
                let (body, next) = parse_body(p, "if", &["elseif", "else"])?;
                elseifs.push((cond, body));
                stop = next;
            }
            if stop.as_deref() == Some("else") {
                p.expect(SyntaxKind::LAngle)?;
                p.expect(SyntaxKind::Identifier)?;
                p.expect(SyntaxKind::RAngle)?;
                let (body, _) = parse_body(p, "if", &[])?;
                else_body = body;
            }
            Ok(IfNode { condition, then_body, elseifs, else_body, location }.into())
        }
        "foreach" => {
            let parenthesized = p.test(SyntaxKind::LParent);
            let item = p.expect(SyntaxKind::Identifier)?.text;
            let index = if p.test(SyntaxKind::Comma) {
                Some(p.expect(SyntaxKind::Identifier)?.text)
            } else {
                None
            };
            let kw = p.expect(SyntaxKind::Identifier)?;
            if kw.as_str() != "in" {
                return Err(p.error_at(
                    crate::diagnostics::ErrorKind::SyntaxError(format!(
                        "expected 'in', found '{}'",
                        kw.as_str()
                    )),
                    &kw,
                ));
            }
            let collection = p.expect(SyntaxKind::Identifier)?.text;
            if parenthesized {
                p.expect(SyntaxKind::RParent)?;
            }
            p.expect(SyntaxKind::RAngle)?;
            let (body, _) = parse_body(p, "foreach", &[])?;
            Ok(ForeachNode { item, index, collection, body, location }.into())
        }
        "while" => {
            let condition = capture_condition(p)?;
            p.expect(SyntaxKind::RAngle)?;
            let (body, _) = parse_body(p, "while", &[])?;
            Ok(WhileNode { condition, body, location }.into())
        }
        "on-data" => {
            let source = p.expect(SyntaxKind::Identifier)?.text;
            p.expect(SyntaxKind::RAngle)?;
            let (on_success, stop) = parse_body(p, "on-data", &["on-error"])?;
            let mut on_error = vec![];
            if stop.as_deref() == Some("on-error") {
                p.expect(SyntaxKind::LAngle)?;
                p.expect(SyntaxKind::Identifier)?;
                p.expect(SyntaxKind::RAngle)?;
                let (body, _) = parse_body(p, "on-data", &[])?;
                on_error = body;
            }
            Ok(OnDataNode { source, on_success, on_error, location }.into())
        }
        "import" => {
            if position != TemplatePosition::TopLevel {
                return Err(p.error("<import> is only allowed at the document top level"));
            }
            let path_token = p.expect(SyntaxKind::StringLiteral)?;
            let path = unescape_string(path_token.as_str());
            let alias = if p.peek().kind() == SyntaxKind::Identifier && p.peek().as_str() == "as" {
                p.consume();
                Some(p.expect(SyntaxKind::Identifier)?.text)
            } else {
                None
            };
            p.expect(SyntaxKind::RAngle)?;
            Ok(ImportNode { path, alias, location }.into())
        }
        "inject" => {
            let path_token = p.expect(SyntaxKind::StringLiteral)?;
            let path = unescape_string(path_token.as_str());
            p.expect(SyntaxKind::RAngle)?;
            Ok(InjectNode { path, location }.into())
        }
        other => Err(p.error_at(
            crate::diagnostics::ErrorKind::SyntaxError(format!(
                "unknown template keyword '{other}'"
            )),
            &keyword,
        )),
    }
}

/// `<set name = value>` accepts a literal, an array, a parenthesized
/// expression, or bare expression tokens running up to the closing '>'.
fn parse_set_value(p: &mut Parser) -> Result<Value> {
    match p.peek().kind() {
        SyntaxKind::StringLiteral
        | SyntaxKind::NumberLiteral
        | SyntaxKind::BoolLiteral
        | SyntaxKind::NullLiteral
        | SyntaxKind::LBrace
        | SyntaxKind::LParent => parse_value(p),
        SyntaxKind::Minus if p.nth(1).kind() == SyntaxKind::NumberLiteral => parse_value(p),
        _ => {
            let location = p.current_location();
            let tokens = capture_condition(p)?;
            Ok(Value::Expression(ExpressionValue { tokens, location }))
        }
    }
}

/// Capture raw expression tokens up to the '>' that closes the template
/// header. Nested parentheses may contain comparison operators; a bare `>`
/// at depth 0 ends the capture (and is left for the caller to consume).
fn capture_condition(p: &mut Parser) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut depth = 0usize;
    loop {
        let token = p.peek();
        match token.kind() {
            SyntaxKind::RAngle if depth == 0 => {
                if tokens.is_empty() {
                    return Err(p.error("expected an expression"));
                }
                return Ok(tokens);
            }
            SyntaxKind::LParent => depth += 1,
            SyntaxKind::RParent => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| p.error("unbalanced ')' in expression"))?;
            }
            SyntaxKind::Eof => return Err(p.error("unexpected end of file inside expression")),
            SyntaxKind::LAngle if p.nth(1).as_str() == "inject" => {
                return Err(
                    p.error_at(crate::diagnostics::ErrorKind::MisplacedInject, &token)
                );
            }
            _ => {}
        }
        tokens.push(p.consume());
    }
}

/// Parse a template body until `</closing>` is consumed, or until one of the
/// `stops` keywords opens (left unconsumed, its name returned).
fn parse_body(
    p: &mut Parser,
    closing: &str,
    stops: &[&str],
) -> Result<(Vec<Node>, Option<SmolStr>)> {
    let mut nodes = vec![];
    loop {
        match p.peek().kind() {
            SyntaxKind::CloseTag => {
                p.consume();
                let kw = p.expect(SyntaxKind::Identifier)?;
                if kw.as_str() != closing {
                    return Err(p.error_at(
                        crate::diagnostics::ErrorKind::SyntaxError(format!(
                            "expected '</{closing}>', found '</{}>'",
                            kw.as_str()
                        )),
                        &kw,
                    ));
                }
                p.expect(SyntaxKind::RAngle)?;
                return Ok((nodes, None));
            }
            SyntaxKind::LAngle
                if stops.contains(&p.nth(1).as_str()) =>
            {
                return Ok((nodes, Some(p.nth(1).text)));
            }
            SyntaxKind::LAngle => {
                nodes.push(parse_template(p, TemplatePosition::BlockChild)?);
            }
            SyntaxKind::At | SyntaxKind::Hash | SyntaxKind::LBracket | SyntaxKind::FreeText => {
                nodes.push(parse_block(p)?);
            }
            SyntaxKind::Eof => {
                return Err(p.error(format!("missing closing tag '</{closing}>'")));
            }
            other => {
                return Err(p.error(format!("unexpected {other} inside template body")));
            }
        }
    }
}
