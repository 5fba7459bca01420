// Template splitting and expression parsing for `<+ ... >` tokens

use crate::error::{EngineError, EngineResult};
use serde_json::Value;

pub const EXPRESSION_START: &str = "<+";
pub const EXPRESSION_END: char = '>';

/// Piece of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart<'a> {
    Text(&'a str),
    /// Full token including delimiters, and the expression body
    Expression { raw: &'a str, body: &'a str },
}

/// One step of a reference path
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl PathSegment {
    pub fn as_field(&self) -> Option<&str> {
        match self {
            PathSegment::Field(name) => Some(name),
            PathSegment::Index(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Reference(Vec<PathSegment>),
    /// `namespace.method(args...)`
    Call {
        namespace: String,
        method: String,
        args: Vec<Expr>,
    },
}

pub fn contains_expression(text: &str) -> bool {
    text.contains(EXPRESSION_START)
}

/// Split text into literal runs and `<+ ... >` tokens. A `>` inside a quoted
/// string literal does not close the token.
pub fn split_template(text: &str) -> EngineResult<Vec<TemplatePart<'_>>> {
    let mut parts = Vec::new();
    let mut rest = text;
    let mut offset = 0;

    while let Some(start) = rest.find(EXPRESSION_START) {
        if start > 0 {
            parts.push(TemplatePart::Text(&rest[..start]));
        }
        let body_start = start + EXPRESSION_START.len();
        let end = find_token_end(&rest[body_start..]).ok_or_else(|| {
            EngineError::InvalidExpression {
                expression: text[offset + start..].to_string(),
                message: "unterminated expression".to_string(),
            }
        })?;
        let body_end = body_start + end;
        parts.push(TemplatePart::Expression {
            raw: &rest[start..=body_end],
            body: rest[body_start..body_end].trim(),
        });
        offset += body_end + 1;
        rest = &rest[body_end + 1..];
    }

    if !rest.is_empty() {
        parts.push(TemplatePart::Text(rest));
    }
    Ok(parts)
}

fn find_token_end(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                EXPRESSION_END => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// Parse an expression body (the text between `<+` and `>`)
pub fn parse_expression(body: &str) -> EngineResult<Expr> {
    let mut parser = Parser {
        source: body,
        chars: body.chars().collect(),
        pos: 0,
    };
    let expr = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> EngineError {
        EngineError::InvalidExpression {
            expression: self.source.to_string(),
            message: format!("{} at position {}", message, self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> EngineResult<Expr> {
        self.skip_ws();
        match self.peek() {
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.string()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => self.number(),
            Some(c) if is_ident_start(c) => self.reference_or_call(),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("empty expression")),
        }
    }

    fn string(&mut self) -> EngineResult<String> {
        let quote = self.chars[self.pos];
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '\\' => {
                    let escaped = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    self.pos += 1;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c if c == quote => return Ok(out),
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> EngineResult<Expr> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Expr::Literal(Value::from(i)));
        }
        let f = text
            .parse::<f64>()
            .map_err(|_| self.error("invalid number"))?;
        Ok(Expr::Literal(Value::from(f)))
    }

    fn segment(&mut self) -> EngineResult<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn reference_or_call(&mut self) -> EngineResult<Expr> {
        let first = self.segment()?;
        match first.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        let mut path = vec![PathSegment::Field(first)];
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    path.push(PathSegment::Field(self.segment()?));
                }
                Some('[') => {
                    self.pos += 1;
                    self.skip_ws();
                    let segment = match self.peek() {
                        Some('"') | Some('\'') => PathSegment::Field(self.string()?),
                        _ => {
                            let digits = self.segment()?;
                            let index = digits
                                .parse::<usize>()
                                .map_err(|_| self.error("invalid index"))?;
                            PathSegment::Index(index)
                        }
                    };
                    if !self.eat(']') {
                        return Err(self.error("expected ']'"));
                    }
                    path.push(segment);
                }
                _ => break,
            }
        }

        if !self.eat('(') {
            return Ok(Expr::Reference(path));
        }

        let (namespace, method) = match path.as_slice() {
            [PathSegment::Field(ns), PathSegment::Field(m)] => (ns.clone(), m.clone()),
            _ => return Err(self.error("calls must have the form namespace.method(...)")),
        };

        let mut args = Vec::new();
        if !self.eat(')') {
            loop {
                args.push(self.expr()?);
                if self.eat(',') {
                    continue;
                }
                if self.eat(')') {
                    break;
                }
                return Err(self.error("expected ',' or ')'"));
            }
        }

        Ok(Expr::Call {
            namespace,
            method,
            args,
        })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> PathSegment {
        PathSegment::Field(name.to_string())
    }

    #[test]
    fn test_split_template() {
        let parts = split_template("image <+output.build.tag> on <+stage.name>").unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], TemplatePart::Text("image "));
        assert_eq!(
            parts[1],
            TemplatePart::Expression {
                raw: "<+output.build.tag>",
                body: "output.build.tag"
            }
        );
        assert_eq!(parts[3], TemplatePart::Expression { raw: "<+stage.name>", body: "stage.name" });
    }

    #[test]
    fn test_split_template_ignores_quoted_terminator() {
        let parts = split_template("<+regex.match(\"a>b\", outcome.x)>!").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], TemplatePart::Text("!"));
    }

    #[test]
    fn test_unterminated_token() {
        assert!(matches!(
            split_template("value <+outcome.x"),
            Err(EngineError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_parse_reference() {
        let expr = parse_expression("child.build.outcome.artifacts[0]['tag']").unwrap();
        assert_eq!(
            expr,
            Expr::Reference(vec![
                field("child"),
                field("build"),
                field("outcome"),
                field("artifacts"),
                PathSegment::Index(0),
                field("tag"),
            ])
        );
    }

    #[test]
    fn test_parse_call_and_literals() {
        let expr = parse_expression("regex.replace('v(\\\\d+)', outcome.version, \"x\")").unwrap();
        match expr {
            Expr::Call {
                namespace,
                method,
                args,
            } => {
                assert_eq!(namespace, "regex");
                assert_eq!(method, "replace");
                assert_eq!(args.len(), 3);
                assert_eq!(args[0], Expr::Literal(Value::String("v(\\d+)".to_string())));
            }
            other => panic!("Expected call, got {:?}", other),
        }

        assert_eq!(parse_expression("42").unwrap(), Expr::Literal(Value::from(42)));
        assert_eq!(parse_expression("true").unwrap(), Expr::Literal(Value::Bool(true)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("outcome.").is_err());
        assert!(parse_expression("a.b.c(1)").is_err());
        assert!(parse_expression("json.select(1, 2").is_err());
        assert!(parse_expression("outcome.x extra").is_err());
    }
}
