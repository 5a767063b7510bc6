//! Recursive-descent parser producing the expression tree.
//!
//! Precedence, lowest first: ternary, `||`, `&&`, equality, comparison and
//! `in`, additive, multiplicative, unary, postfix access.

use serde_json::Value;

use super::functions;
use super::lexer::{tokenize, Token, TokenKind};

/// Deepest nesting accepted before the parser gives up.
const MAX_DEPTH: usize = 64;

/// Longest expression source accepted.
pub(crate) const MAX_SOURCE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Undefined,
    /// Root identifier: `state`, `input`, `parameters`, `env` or `error`.
    Variable(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// Call to a built-in; the name is checked against the whitelist and
    /// arity at parse time.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

impl Expr {
    /// Dotted path for variable references, used in error reports.
    pub fn path(&self) -> Option<String> {
        match self {
            Expr::Variable(name) => Some(name.clone()),
            Expr::Member { object, property } => {
                object.path().map(|base| format!("{base}.{property}"))
            }
            Expr::Index { object, index } => {
                let base = object.path()?;
                match index.as_ref() {
                    Expr::Literal(Value::String(key)) => Some(format!("{base}['{key}']")),
                    Expr::Literal(Value::Number(n)) => Some(format!("{base}[{n}]")),
                    _ => Some(format!("{base}[..]")),
                }
            }
            _ => None,
        }
    }

    /// Whether any variable reference in the tree starts at `root`.
    pub fn references_root(&self, root: &str) -> bool {
        match self {
            Expr::Variable(name) => name == root,
            Expr::Literal(_) | Expr::Undefined => false,
            Expr::Member { object, .. } => object.references_root(root),
            Expr::Index { object, index } => {
                object.references_root(root) || index.references_root(root)
            }
            Expr::Array(items) => items.iter().any(|e| e.references_root(root)),
            Expr::Unary { operand, .. } => operand.references_root(root),
            Expr::Binary { left, right, .. } => {
                left.references_root(root) || right.references_root(root)
            }
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.references_root(root)
                    || then_branch.references_root(root)
                    || else_branch.references_root(root)
            }
            Expr::Call { args, .. } => args.iter().any(|e| e.references_root(root)),
        }
    }
}

/// Parse failure: byte offset plus message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseError {
    pub position: usize,
    pub message: String,
}

/// Parse a complete expression.
pub(crate) fn parse(source: &str) -> Result<Expr, ParseError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(ParseError {
            position: MAX_SOURCE_LEN,
            message: format!("expression longer than {MAX_SOURCE_LEN} bytes"),
        });
    }
    let tokens = tokenize(source).map_err(|e| ParseError {
        position: e.position,
        message: e.message,
    })?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(ParseError {
            position: trailing.position,
            message: format!("unexpected {}", trailing.kind.describe()),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> Result<Token, ParseError> {
        let token = self.peek().clone();
        if token.kind == kind {
            Ok(self.advance())
        } else {
            Err(ParseError {
                position: token.position,
                message: format!("expected {context}, found {}", token.kind.describe()),
            })
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError {
                position: self.peek().position,
                message: format!("expression nested deeper than {MAX_DEPTH} levels"),
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.ternary();
        self.leave();
        result
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let condition = self.or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_branch = self.expression()?;
        self.expect(TokenKind::Colon, "':' in conditional expression")?;
        let else_branch = self.expression()?;
        Ok(Expr::Conditional {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::LtEq => BinaryOp::LtEq,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::GtEq => BinaryOp::GtEq,
                TokenKind::In => BinaryOp::In,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let token = self.advance();
                expr = match token.kind {
                    TokenKind::Ident(property) => Expr::Member {
                        object: Box::new(expr),
                        property,
                    },
                    // `items.0` is shorthand for `items[0]`
                    TokenKind::Number(n) if n.is_u64() => Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(Expr::Literal(Value::Number(n))),
                    },
                    other => {
                        return Err(ParseError {
                            position: token.position,
                            message: format!(
                                "expected property name after '.', found {}",
                                other.describe()
                            ),
                        });
                    }
                };
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.expect(TokenKind::RBracket, "']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Undefined => Ok(Expr::Undefined),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let items = self.list(TokenKind::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let args = self.list(TokenKind::RParen, "')'")?;
                    check_call(&name, args.len(), token.position)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            other => Err(ParseError {
                position: token.position,
                message: format!("unexpected {}", other.describe()),
            }),
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn list(&mut self, close: TokenKind, context: &str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(close.clone(), context)?;
            return Ok(items);
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn check_call(name: &str, argc: usize, position: usize) -> Result<(), ParseError> {
    let Some(builtin) = functions::lookup(name) else {
        return Err(ParseError {
            position,
            message: format!("unknown function '{name}'"),
        });
    };
    if argc < builtin.min_args || builtin.max_args.is_some_and(|max| argc > max) {
        let expected = match builtin.max_args {
            Some(max) if max == builtin.min_args => format!("{max}"),
            Some(max) => format!("{}..={max}", builtin.min_args),
            None => format!("at least {}", builtin.min_args),
        };
        return Err(ParseError {
            position,
            message: format!("function '{name}' expects {expected} arguments, got {argc}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3 == 7 && !false").unwrap();
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::And);
        let Expr::Binary { op, left, .. } = *left else {
            panic!("expected equality");
        };
        assert_eq!(op, BinaryOp::Eq);
        let Expr::Binary { op, right, .. } = *left else {
            panic!("expected addition");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_paths() {
        let expr = parse("state.tasks['fetch'].output.rows[0]").unwrap();
        assert_eq!(
            expr.path().as_deref(),
            Some("state.tasks['fetch'].output.rows[0]")
        );
        assert!(expr.references_root("state"));
        assert!(!expr.references_root("error"));
    }

    #[test]
    fn test_ternary_and_array() {
        let expr = parse("input.n > 1 ? [1, 'two'] : []").unwrap();
        let Expr::Conditional { then_branch, else_branch, .. } = expr else {
            panic!("expected conditional");
        };
        assert_eq!(
            *then_branch,
            Expr::Array(vec![Expr::Literal(json!(1)), Expr::Literal(json!("two"))])
        );
        assert_eq!(*else_branch, Expr::Array(vec![]));
    }

    #[test]
    fn test_error_root_detection() {
        let expr = parse("error.kind == 'task_timeout' || upper(error.message) == 'X'").unwrap();
        assert!(expr.references_root("error"));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = parse("system('rm -rf /')").unwrap_err();
        assert!(err.message.contains("unknown function 'system'"), "got: {}", err.message);
        assert_eq!(err.position, 0);
    }

    #[test]
    fn test_arity_checked() {
        let err = parse("upper()").unwrap_err();
        assert!(err.message.contains("expects 1 arguments"), "got: {}", err.message);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse("(1 + 2").unwrap_err().message.contains("')'"));
        assert!(parse("a.").is_err());
        assert!(parse("1 2").unwrap_err().message.contains("unexpected"));
        assert!(parse("a ? b").unwrap_err().message.contains("':'"));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nested"), "got: {}", err.message);

        let negations = format!("{}true", "!".repeat(100));
        assert!(parse(&negations).is_err());
    }

    #[test]
    fn test_length_limit() {
        let long = "1 + ".repeat(MAX_SOURCE_LEN) + "1";
        assert!(parse(&long).unwrap_err().message.contains("longer"));
    }
}
