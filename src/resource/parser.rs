//! Recursive-descent parser producing the typed expression tree.
//!
//! The accepted grammar is a small subset of Python expressions:
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := arith (cmp_op arith)*
//! cmp_op     := "==" | "!=" | "<" | "<=" | ">" | ">=" | "in"
//! arith      := term (("+" | "-") term)*
//! term       := factor (("*" | "/" | "//" | "%") factor)*
//! factor     := ("+" | "-") factor | power
//! power      := primary ["**" factor]
//! primary    := literal | list | tuple | "(" expr ")"
//!             | NAME "." NAME
//!             | ("int" | "float" | "bool") "(" [expr] ")"
//! ```
//!
//! Anything else (subscripts, lambdas, comprehensions, `is`, `not in`,
//! arbitrary calls, nested attributes) is rejected here so that it can
//! never reach evaluation.

use super::eval::Value;
use super::lexer::{Token, TokenKind, tokenize};
use super::{ResourceError, ResourceResult};

/// Python keywords that have no meaning in a resource expression.
const REJECTED_KEYWORDS: &[&str] = &[
    "lambda", "if", "else", "for", "while", "yield", "await", "async", "import", "from", "def",
    "class", "return", "with", "as", "del", "global", "nonlocal", "assert", "pass", "raise",
    "try", "except", "finally", "break", "continue",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
}

/// Type coercion helpers, the only callables in the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Int,
    Float,
    Bool,
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Attribute {
        variable: String,
        attribute: String,
    },
    Call {
        func: Builtin,
        arg: Option<Box<Expr>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Bool {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        comparisons: Vec<(CmpOp, Expr)>,
    },
}

impl Expr {
    /// Collects the distinct variable names the expression reads, in order
    /// of first appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::List(items) | Expr::Tuple(items) | Expr::Bool { values: items, .. } => {
                for item in items {
                    item.collect_variables(names);
                }
            }
            Expr::Attribute { variable, .. } => {
                if !names.contains(variable) {
                    names.push(variable.clone());
                }
            }
            Expr::Call { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_variables(names);
                }
            }
            Expr::Unary { operand, .. } => operand.collect_variables(names),
            Expr::Binary { left, right, .. } => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
            Expr::Compare { left, comparisons } => {
                left.collect_variables(names);
                for (_, expr) in comparisons {
                    expr.collect_variables(names);
                }
            }
        }
    }
}

/// Parses one expression.
pub fn parse(source: &str) -> ResourceResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    parser.expect_end()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Name(n) if n == keyword)
    }

    fn syntax<T>(&self, message: impl Into<String>) -> ResourceResult<T> {
        Err(ResourceError::Syntax {
            offset: self.offset(),
            message: message.into(),
        })
    }

    fn unsupported<T>(&self, what: impl Into<String>) -> ResourceResult<T> {
        Err(ResourceError::Unsupported(what.into()))
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> ResourceResult<()> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            self.syntax(format!("expected {}", what))
        }
    }

    fn expect_end(&mut self) -> ResourceResult<()> {
        match self.peek().clone() {
            TokenKind::Eof => Ok(()),
            TokenKind::Name(name) if REJECTED_KEYWORDS.contains(&name.as_str()) => {
                self.unsupported(format!("keyword '{}'", name))
            }
            TokenKind::Name(name) if name == "is" => self.unsupported("'is' comparison"),
            TokenKind::Name(name) if name == "not" && self.peek_at(1) == &name_token("in") => {
                self.unsupported("'not in' comparison")
            }
            TokenKind::Unsupported(op) => self.unsupported(format!("operator '{}'", op)),
            TokenKind::LBracket => self.unsupported("subscript"),
            _ => self.syntax("unexpected trailing input"),
        }
    }

    fn expr(&mut self) -> ResourceResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> ResourceResult<Expr> {
        let first = self.and_expr()?;
        if !self.is_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.is_keyword("or") {
            self.advance();
            values.push(self.and_expr()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_expr(&mut self) -> ResourceResult<Expr> {
        let first = self.not_expr()?;
        if !self.is_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.is_keyword("and") {
            self.advance();
            values.push(self.not_expr()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::And,
            values,
        })
    }

    fn not_expr(&mut self) -> ResourceResult<Expr> {
        if self.is_keyword("not") {
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ResourceResult<Expr> {
        let left = self.arith()?;
        let mut comparisons = Vec::new();
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => CmpOp::Eq,
                TokenKind::NotEq => CmpOp::NotEq,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::LtE => CmpOp::LtE,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::GtE => CmpOp::GtE,
                TokenKind::Name(n) if n == "in" => CmpOp::In,
                TokenKind::Name(n) if n == "is" => return self.unsupported("'is' comparison"),
                TokenKind::Name(n) if n == "not" && self.peek_at(1) == &name_token("in") => {
                    return self.unsupported("'not in' comparison");
                }
                _ => break,
            };
            self.advance();
            comparisons.push((op, self.arith()?));
        }
        if comparisons.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                comparisons,
            })
        }
    }

    fn arith(&mut self) -> ResourceResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> ResourceResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> ResourceResult<Expr> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            TokenKind::Unsupported(op) => {
                let op = *op;
                return self.unsupported(format!("operator '{}'", op));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let operand = self.factor()?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            None => self.power(),
        }
    }

    fn power(&mut self) -> ResourceResult<Expr> {
        let base = self.primary()?;
        if *self.peek() == TokenKind::DoubleStar {
            self.advance();
            let exponent = self.factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> ResourceResult<Expr> {
        let expr = self.atom()?;
        match self.peek() {
            TokenKind::LBracket => self.unsupported("subscript"),
            TokenKind::LParen => self.unsupported("call on an expression"),
            TokenKind::Dot => self.unsupported("nested attribute access"),
            _ => Ok(expr),
        }
    }

    fn atom(&mut self) -> ResourceResult<Expr> {
        match self.advance() {
            TokenKind::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            TokenKind::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            TokenKind::Str(mut s) => {
                // Adjacent literals concatenate, as in 'a' 'b'.
                while let TokenKind::Str(next) = self.peek().clone() {
                    self.advance();
                    s.push_str(&next);
                }
                Ok(Expr::Literal(Value::Str(s)))
            }
            TokenKind::LParen => self.parenthesized(),
            TokenKind::LBracket => {
                let items = self.sequence(TokenKind::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            TokenKind::LBrace => self.unsupported("dict or set literal"),
            TokenKind::Name(name) => self.name(name),
            TokenKind::Unsupported(op) => self.unsupported(format!("operator '{}'", op)),
            TokenKind::Eof => {
                self.pos = self.tokens.len() - 1;
                self.syntax("unexpected end of expression")
            }
            _ => {
                self.pos -= 1;
                self.syntax("unexpected token")
            }
        }
    }

    fn parenthesized(&mut self) -> ResourceResult<Expr> {
        if *self.peek() == TokenKind::RParen {
            self.advance();
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.expr()?;
        if self.is_keyword("for") {
            return self.unsupported("generator expression");
        }
        if *self.peek() == TokenKind::RParen {
            self.advance();
            return Ok(first);
        }
        self.expect(TokenKind::Comma, "',' or ')'")?;
        let mut items = vec![first];
        items.extend(self.sequence(TokenKind::RParen, "')'")?);
        Ok(Expr::Tuple(items))
    }

    /// Parses comma-separated items up to `close`, allowing a trailing comma.
    fn sequence(&mut self, close: TokenKind, what: &str) -> ResourceResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if *self.peek() == close {
                self.advance();
                return Ok(items);
            }
            items.push(self.expr()?);
            if self.is_keyword("for") {
                return self.unsupported("comprehension");
            }
            if *self.peek() == TokenKind::Comma {
                self.advance();
                continue;
            }
            self.expect(close.clone(), what)?;
            return Ok(items);
        }
    }

    fn name(&mut self, name: String) -> ResourceResult<Expr> {
        match name.as_str() {
            "True" => return Ok(Expr::Literal(Value::Bool(true))),
            "False" => return Ok(Expr::Literal(Value::Bool(false))),
            "None" => return Ok(Expr::Literal(Value::None)),
            "and" | "or" | "in" | "is" | "not" => {
                self.pos -= 1;
                return self.syntax(format!("unexpected keyword '{}'", name));
            }
            n if REJECTED_KEYWORDS.contains(&n) => {
                return self.unsupported(format!("keyword '{}'", n));
            }
            _ => {}
        }

        match self.peek().clone() {
            TokenKind::Dot => {
                self.advance();
                let TokenKind::Name(attribute) = self.advance() else {
                    self.pos -= 1;
                    return self.syntax("expected attribute name after '.'");
                };
                if *self.peek() == TokenKind::LParen {
                    return self.unsupported(format!("call to '{}.{}'", name, attribute));
                }
                Ok(Expr::Attribute {
                    variable: name,
                    attribute,
                })
            }
            TokenKind::LParen => {
                let func = match name.as_str() {
                    "int" => Builtin::Int,
                    "float" => Builtin::Float,
                    "bool" => Builtin::Bool,
                    other => return self.unsupported(format!("call to '{}'", other)),
                };
                self.advance();
                let args = self.sequence(TokenKind::RParen, "')'")?;
                if args.len() > 1 {
                    return self.unsupported(format!(
                        "'{}' with more than one argument",
                        name
                    ));
                }
                Ok(Expr::Call {
                    func,
                    arg: args.into_iter().next().map(Box::new),
                })
            }
            _ => self.unsupported(format!(
                "bare reference to '{}' (read an attribute such as '{}.name')",
                name, name
            )),
        }
    }
}

fn name_token(name: &str) -> TokenKind {
    TokenKind::Name(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(variable: &str, attribute: &str) -> Expr {
        Expr::Attribute {
            variable: variable.into(),
            attribute: attribute.into(),
        }
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse("package.name == 'fwts'").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                left: Box::new(attr("package", "name")),
                comparisons: vec![(CmpOp::Eq, Expr::Literal(Value::Str("fwts".into())))],
            }
        );
    }

    #[test]
    fn test_parse_precedence() {
        // not binds looser than comparison, and looser than not
        let expr = parse("not a.x == '1' and a.y == '2' or a.z == '3'").unwrap();
        let Expr::Bool { op: BoolOp::Or, values } = expr else {
            panic!("expected or at the top");
        };
        assert_eq!(values.len(), 2);
        let Expr::Bool { op: BoolOp::And, values: inner } = &values[0] else {
            panic!("expected and below or");
        };
        assert!(matches!(inner[0], Expr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        let expr = parse("int(m.size) * 2 + 1 > 10").unwrap();
        let Expr::Compare { left, .. } = expr else {
            panic!("expected comparison");
        };
        assert!(matches!(*left, Expr::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn test_parse_chained_comparison() {
        let expr = parse("1 < int(d.count) <= 4").unwrap();
        let Expr::Compare { comparisons, .. } = expr else {
            panic!("expected comparison");
        };
        assert_eq!(comparisons.len(), 2);
    }

    #[test]
    fn test_parse_list_and_tuple_literals() {
        assert!(matches!(
            parse("d.bus in ['usb', 'pci',]").unwrap(),
            Expr::Compare { .. }
        ));
        let Expr::Compare { comparisons, .. } = parse("d.bus in ('usb',)").unwrap() else {
            panic!("expected comparison");
        };
        assert!(matches!(&comparisons[0].1, Expr::Tuple(items) if items.len() == 1));
    }

    #[test]
    fn test_parse_collects_variables() {
        let expr = parse("a.x == '1' and b.y == '2' and a.z == '3'").unwrap();
        assert_eq!(expr.variables(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_reject_not_in() {
        assert!(matches!(
            parse("'x' not in p.name"),
            Err(ResourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_is() {
        assert!(matches!(
            parse("p.name is None"),
            Err(ResourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_arbitrary_calls() {
        assert!(matches!(
            parse("len(p.name) > 1"),
            Err(ResourceError::Unsupported(_))
        ));
        assert!(matches!(
            parse("p.name.startswith('x')"),
            Err(ResourceError::Unsupported(_))
        ));
        assert!(matches!(
            parse("p.name('x')"),
            Err(ResourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_subscript_and_lambda() {
        assert!(matches!(
            parse("p.name[0] == 'x'"),
            Err(ResourceError::Unsupported(_))
        ));
        assert!(matches!(
            parse("lambda: p.name"),
            Err(ResourceError::Unsupported(_))
        ));
        assert!(matches!(
            parse("[x for x in p.name]"),
            Err(ResourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_bare_variable() {
        assert!(matches!(parse("package"), Err(ResourceError::Unsupported(_))));
    }

    #[test]
    fn test_reject_bitwise() {
        assert!(matches!(
            parse("int(p.x) & 1"),
            Err(ResourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("p.name =="), Err(ResourceError::Syntax { .. })));
        assert!(matches!(parse("(p.name == 'x'"), Err(ResourceError::Syntax { .. })));
        assert!(matches!(parse(""), Err(ResourceError::Syntax { .. })));
    }
}
