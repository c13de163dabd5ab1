use super::template::TemplatePosition;
use super::{parse_block, parse_template, Parser, SyntaxKind};
use crate::diagnostics::Result;
use crate::object_tree::Document;

pub fn parse_document(p: &mut Parser) -> Result<Document> {
    let mut nodes = vec![];
    loop {
        match p.peek().kind() {
            SyntaxKind::Eof => break,
            SyntaxKind::LAngle => {
                nodes.push(parse_template(p, TemplatePosition::TopLevel)?);
            }
            SyntaxKind::At
            | SyntaxKind::Hash
            | SyntaxKind::LBracket
            | SyntaxKind::FreeText => {
                nodes.push(parse_block(p)?);
            }
            SyntaxKind::CloseTag => {
                return Err(p.error("closing tag without a matching opening tag"));
            }
            other => {
                return Err(
                    p.error(format!("expected a block, template, import or inject, found {other}"))
                );
            }
        }
    }
    Ok(Document { nodes })
}
