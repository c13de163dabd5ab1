use super::template::TemplatePosition;
use super::{parse_template, Parser, SyntaxKind, Token};
use crate::diagnostics::{ErrorKind, Result};
use crate::lexer::{free_text_content, unescape_string};
use crate::object_tree::{
    Block, ExpressionValue, FreeTextNode, Literal, Node, Tag, TagKind, Value,
};
use std::cell::RefCell;
use std::rc::Rc;

/// `tag* '[' identifier? properties? child* ']'`, or a tagged free-text run.
/// Tags with no bracket following (`#b` alone) stand for an anonymous block
/// carrying only those tags.
pub fn parse_block(p: &mut Parser) -> Result<Node> {
    let tags = parse_tags(p)?;

    if p.peek().kind() == SyntaxKind::FreeText {
        let token = p.consume();
        return Ok(Node::FreeText(FreeTextNode {
            content: free_text_content(token.as_str()).to_string(),
            tags,
            location: p.token_location(&token),
        }));
    }

    if !tags.is_empty() && p.peek().kind() != SyntaxKind::LBracket {
        let location = tags[0].location.clone();
        let mut block = Block::new(None, location);
        block.tags = tags;
        return Ok(Node::Block(Rc::new(RefCell::new(block))));
    }

    let open = p.expect(SyntaxKind::LBracket)?;
    let mut block = Block::new(None, p.token_location(&open));
    block.tags = tags;

    if p.peek().kind() == SyntaxKind::Identifier {
        block.id = Some(p.consume().text);
    }

    if p.peek().kind() == SyntaxKind::LParent {
        parse_properties(p, &mut block)?;
    }

    loop {
        match p.peek().kind() {
            SyntaxKind::RBracket => {
                p.consume();
                break;
            }
            SyntaxKind::LAngle => {
                block.children.push(parse_template(p, TemplatePosition::BlockChild)?);
            }
            SyntaxKind::At | SyntaxKind::Hash | SyntaxKind::LBracket | SyntaxKind::FreeText => {
                block.children.push(parse_block(p)?);
            }
            SyntaxKind::Eof => {
                return Err(p.error("unexpected end of file, expected ']'"));
            }
            other => {
                return Err(p.error(format!("expected a child block or ']', found {other}")));
            }
        }
    }

    Ok(Node::Block(Rc::new(RefCell::new(block))))
}

fn parse_tags(p: &mut Parser) -> Result<Vec<Tag>> {
    let mut tags = vec![];
    loop {
        let kind = match p.peek().kind() {
            SyntaxKind::At => TagKind::Definition,
            SyntaxKind::Hash => TagKind::Instance,
            _ => break,
        };
        let marker = p.consume();
        let mut name = p.expect(SyntaxKind::Identifier)?.text;
        // Namespaced tags from aliased imports: `#alias.name`
        if p.peek().kind() == SyntaxKind::Dot && p.nth(1).kind() == SyntaxKind::Identifier {
            p.consume();
            let rest = p.consume();
            name = format!("{name}.{}", rest.as_str()).into();
        }
        let argument = if p.test(SyntaxKind::LParent) {
            let arg = p.expect(SyntaxKind::Identifier)?.text;
            p.expect(SyntaxKind::RParent)?;
            Some(arg)
        } else {
            None
        };
        tags.push(Tag { kind, name, argument, location: p.token_location(&marker) });
    }
    Ok(tags)
}

/// `'(' ( name ':' value (',' name ':' value)* )? ')'`
fn parse_properties(p: &mut Parser, block: &mut Block) -> Result<()> {
    p.expect(SyntaxKind::LParent)?;
    if p.test(SyntaxKind::RParent) {
        return Ok(());
    }
    loop {
        let name = p.expect(SyntaxKind::Identifier)?;
        p.expect(SyntaxKind::Colon)?;
        let value = parse_value(p)?;
        if block.properties.insert(name.text.clone(), value).is_some() {
            return Err(p.error(format!("duplicate property '{}'", name.text)));
        }
        if !p.test(SyntaxKind::Comma) {
            p.expect(SyntaxKind::RParent)?;
            return Ok(());
        }
    }
}

/// A literal, an array `{ ... }`, or a parenthesized expression whose tokens
/// are captured verbatim for later evaluation.
pub fn parse_value(p: &mut Parser) -> Result<Value> {
    match p.peek().kind() {
        SyntaxKind::StringLiteral => {
            let token = p.consume();
            Ok(Value::Literal(Literal::String(unescape_string(token.as_str()).into())))
        }
        SyntaxKind::NumberLiteral => {
            let token = p.consume();
            let n = token
                .as_str()
                .parse::<f64>()
                .map_err(|_| p.error_at(ErrorKind::SyntaxError("invalid number".into()), &token))?;
            Ok(Value::Literal(Literal::Number(n)))
        }
        SyntaxKind::Minus if p.nth(1).kind() == SyntaxKind::NumberLiteral => {
            p.consume();
            let token = p.consume();
            let n = token
                .as_str()
                .parse::<f64>()
                .map_err(|_| p.error_at(ErrorKind::SyntaxError("invalid number".into()), &token))?;
            Ok(Value::Literal(Literal::Number(-n)))
        }
        SyntaxKind::BoolLiteral => {
            let token = p.consume();
            Ok(Value::Literal(Literal::Bool(token.as_str() == "true")))
        }
        SyntaxKind::NullLiteral => {
            p.consume();
            Ok(Value::Literal(Literal::Null))
        }
        SyntaxKind::LBrace => {
            p.consume();
            let mut elements = vec![];
            if p.test(SyntaxKind::RBrace) {
                return Ok(Value::Array(elements));
            }
            loop {
                elements.push(parse_value(p)?);
                if !p.test(SyntaxKind::Comma) {
                    p.expect(SyntaxKind::RBrace)?;
                    return Ok(Value::Array(elements));
                }
            }
        }
        SyntaxKind::LParent => {
            let open = p.consume();
            let location = p.token_location(&open);
            let tokens = capture_expression_tokens(p)?;
            Ok(Value::Expression(ExpressionValue { tokens, location }))
        }
        other => Err(p.error(format!("expected a value, found {other}"))),
    }
}

/// Capture the raw tokens of a parenthesized expression, up to (and
/// consuming) the matching ')'. The tokens themselves are not parsed here.
pub fn capture_expression_tokens(p: &mut Parser) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut depth = 0usize;
    loop {
        let token = p.peek();
        match token.kind() {
            SyntaxKind::RParent if depth == 0 => {
                p.consume();
                return Ok(tokens);
            }
            SyntaxKind::RParent => depth -= 1,
            SyntaxKind::LParent => depth += 1,
            SyntaxKind::Eof => {
                return Err(p.error("unexpected end of file inside expression"));
            }
            SyntaxKind::LAngle if p.nth(1).as_str() == "inject" => {
                return Err(p.error_at(ErrorKind::MisplacedInject, &token));
            }
            _ => {}
        }
        tokens.push(p.consume());
    }
}
