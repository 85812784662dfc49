//! The plugin script language.
//!
//! ```text
//! # mean of the values above the median
//! let m = data.median();
//! let total = 0;
//! repeat 3 { total = total + 1; }
//! { "median": m, "mean": mean(data), "loops": total }
//! ```
//!
//! Every call and operator is classified by the [`MethodGate`] before it is
//! performed, and every call and loop iteration is a cancellation
//! checkpoint for the resource watcher.

use super::dispatch;
use super::method_gate::MethodGate;
use super::resource_monitor::ExecutionGuard;
use super::value::Value;
use crate::error::SandboxError;
use std::collections::{BTreeMap, HashMap};

/// Deepest nesting of expressions and blocks the parser accepts
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Let,
    Repeat,
    True,
    False,
    Nil,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Dot,
    Colon,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

fn syntax(line: usize, column: usize, message: impl Into<String>) -> SandboxError {
    SandboxError::Syntax {
        line,
        column,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, SandboxError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let (mut i, mut line, mut column) = (0usize, 1usize, 1usize);

    while i < chars.len() {
        let c = chars[i];
        let (start_line, start_column) = (line, column);
        let mut advance = 1;

        let token = match c {
            '\n' => {
                line += 1;
                column = 1;
                i += 1;
                continue;
            }
            c if c.is_whitespace() => None,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ',' => Some(Token::Comma),
            ';' => Some(Token::Semicolon),
            '.' => Some(Token::Dot),
            ':' => Some(Token::Colon),
            '=' => Some(Token::Assign),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '*' if chars.get(i + 1) == Some(&'*') => {
                advance = 2;
                Some(Token::Power)
            }
            '*' => Some(Token::Star),
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None | Some('\n') => {
                            return Err(syntax(start_line, start_column, "unterminated string"))
                        }
                        Some(ch) if *ch == quote => break,
                        Some('\\') => {
                            let escaped = match chars.get(j + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(other) => *other,
                                None => {
                                    return Err(syntax(start_line, start_column, "unterminated string"))
                                }
                            };
                            text.push(escaped);
                            j += 2;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            j += 1;
                        }
                    }
                }
                advance = j + 1 - i;
                Some(Token::Str(text))
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                if chars.get(j) == Some(&'.') && chars.get(j + 1).is_some_and(char::is_ascii_digit) {
                    j += 1;
                    while j < chars.len() && chars[j].is_ascii_digit() {
                        j += 1;
                    }
                }
                let literal: String = chars[i..j].iter().collect();
                let number = literal.parse::<f64>().map_err(|_| {
                    syntax(start_line, start_column, format!("invalid number '{literal}'"))
                })?;
                advance = j - i;
                Some(Token::Number(number))
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                advance = j - i;
                Some(match word.as_str() {
                    "let" => Token::Let,
                    "repeat" => Token::Repeat,
                    "true" => Token::True,
                    "false" => Token::False,
                    "nil" => Token::Nil,
                    _ => Token::Ident(word),
                })
            }
            other => {
                return Err(syntax(
                    start_line,
                    start_column,
                    format!("unexpected character '{other}'"),
                ))
            }
        };

        if let Some(token) = token {
            tokens.push(Spanned {
                token,
                line: start_line,
                column: start_column,
            });
        }
        i += advance;
        column += advance;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        line,
        column,
    });
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let(String, Expr),
    Assign(String, Expr),
    Repeat { count: Expr, body: Vec<Stmt> },
    Expr(Expr),
}

/// A parsed, syntactically valid script
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    statements: Vec<Stmt>,
}

/// Parse `source`; this is the syntax validation step
pub fn parse(source: &str) -> Result<Script, SandboxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let statements = parser.block_until(&Token::Eof)?;
    Ok(Script { statements })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn next(&mut self) -> Spanned {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        let at = self.peek();
        syntax(at.line, at.column, message)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), SandboxError> {
        if self.peek().token == expected {
            self.next();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(&self.peek().token))))
        }
    }

    fn nest(&mut self) -> Result<(), SandboxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING} levels")));
        }
        Ok(())
    }

    fn unnest(&mut self) {
        self.depth -= 1;
    }

    fn block_until(&mut self, end: &Token) -> Result<Vec<Stmt>, SandboxError> {
        let mut statements = Vec::new();
        while &self.peek().token != end {
            if self.peek().token == Token::Eof {
                return Err(self.error("unexpected end of input, expected '}'"));
            }
            if self.peek().token == Token::Semicolon {
                self.next();
                continue;
            }
            statements.push(self.statement(end)?);
        }
        Ok(statements)
    }

    fn statement(&mut self, end: &Token) -> Result<Stmt, SandboxError> {
        let stmt = match (self.peek().token.clone(), self.peek_at(1).clone()) {
            (Token::Let, _) => {
                self.next();
                let name = match self.next().token {
                    Token::Ident(name) => name,
                    other => {
                        return Err(self.error(format!(
                            "expected variable name after 'let', found {}",
                            describe(&other)
                        )))
                    }
                };
                self.expect(Token::Assign, "'='")?;
                Stmt::Let(name, self.expression()?)
            }
            (Token::Ident(name), Token::Assign) => {
                self.next();
                self.next();
                Stmt::Assign(name, self.expression()?)
            }
            (Token::Repeat, _) => {
                self.next();
                let count = self.expression()?;
                self.expect(Token::LBrace, "'{' after repeat count")?;
                self.nest()?;
                let body = self.block_until(&Token::RBrace)?;
                self.unnest();
                self.expect(Token::RBrace, "'}'")?;
                return Ok(Stmt::Repeat { count, body });
            }
            _ => Stmt::Expr(self.expression()?),
        };

        match &self.peek().token {
            Token::Semicolon => {
                self.next();
            }
            token if token == end => {}
            other => {
                return Err(self.error(format!("expected ';', found {}", describe(other))));
            }
        }
        Ok(stmt)
    }

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        self.nest()?;
        let expr = self.additive();
        self.unnest();
        expr
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().token {
                Token::Plus => "+",
                Token::Minus => "-",
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().token {
                Token::Star => "*",
                Token::Slash => "/",
                Token::Percent => "%",
                _ => return Ok(lhs),
            };
            self.next();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        if self.peek().token == Token::Minus {
            self.next();
            self.nest()?;
            let operand = self.unary();
            self.unnest();
            return Ok(Expr::Call {
                name: "neg".into(),
                args: vec![operand?],
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, SandboxError> {
        let base = self.postfix()?;
        if self.peek().token == Token::Power {
            self.next();
            self.nest()?;
            let exponent = self.unary();
            self.unnest();
            return Ok(binary("**", base, exponent?));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.primary()?;
        while self.peek().token == Token::Dot {
            self.next();
            let name = match self.next().token {
                Token::Ident(name) => name,
                other => {
                    return Err(self.error(format!(
                        "expected method name after '.', found {}",
                        describe(&other)
                    )))
                }
            };
            let mut args = vec![expr];
            if self.peek().token == Token::LParen {
                self.next();
                args.extend(self.arguments(Token::RParen, "')'")?);
            }
            expr = Expr::Call { name, args };
        }
        Ok(expr)
    }

    fn arguments(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, SandboxError> {
        let mut items = Vec::new();
        while self.peek().token != close {
            items.push(self.expression()?);
            if self.peek().token == Token::Comma {
                self.next();
            } else {
                break;
            }
        }
        self.expect(close, what)?;
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        let token = self.next();
        match token.token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Text(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Nil => Ok(Expr::Literal(Value::Nil)),
            Token::Ident(name) if self.peek().token == Token::LParen => {
                self.next();
                let args = self.arguments(Token::RParen, "')'")?;
                Ok(Expr::Call { name, args })
            }
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                self.nest()?;
                let items = self.arguments(Token::RBracket, "']'");
                self.unnest();
                Ok(Expr::List(items?))
            }
            Token::LBrace => {
                self.nest()?;
                let entries = self.map_entries();
                self.unnest();
                Ok(Expr::Map(entries?))
            }
            other => Err(syntax(
                token.line,
                token.column,
                format!("unexpected {}", describe(&other)),
            )),
        }
    }

    fn map_entries(&mut self) -> Result<Vec<(String, Expr)>, SandboxError> {
        let mut entries = Vec::new();
        while self.peek().token != Token::RBrace {
            let key = match self.next().token {
                Token::Str(key) | Token::Ident(key) => key,
                other => return Err(self.error(format!("expected map key, found {}", describe(&other)))),
            };
            self.expect(Token::Colon, "':' after map key")?;
            entries.push((key, self.expression()?));
            if self.peek().token == Token::Comma {
                self.next();
            } else {
                break;
            }
        }
        self.expect(Token::RBrace, "'}'")?;
        Ok(entries)
    }
}

fn binary(op: &str, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Call {
        name: op.to_string(),
        args: vec![lhs, rhs],
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Str(_) => "string".into(),
        Token::Ident(name) => format!("'{name}'"),
        Token::Eof => "end of input".into(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Evaluates scripts against a variable environment.
///
/// Without a gate every implemented operation is reachable; without a guard
/// nothing is cancelled or depth-limited.
pub struct Interpreter<'a> {
    gate: Option<&'a MethodGate>,
    guard: Option<&'a ExecutionGuard>,
    variables: HashMap<String, Value>,
    output: String,
}

impl<'a> Interpreter<'a> {
    pub fn new(gate: Option<&'a MethodGate>, guard: Option<&'a ExecutionGuard>) -> Self {
        Self {
            gate,
            guard,
            variables: HashMap::new(),
            output: String::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.store(name.into(), value);
    }

    /// Run every statement; the value of the last one is the result
    pub fn run(&mut self, script: &Script) -> Result<Value, SandboxError> {
        self.block(&script.statements)
    }

    /// Text written by `print`/`puts`/`warn`
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }

    fn store(&mut self, name: String, value: Value) {
        if let Some(guard) = self.guard {
            guard.record_allocation(value.footprint());
        }
        if let Some(old) = self.variables.insert(name, value) {
            if let Some(guard) = self.guard {
                guard.release(old.footprint());
            }
        }
    }

    fn checkpoint(&self) -> Result<(), SandboxError> {
        match self.guard {
            Some(guard) => guard.checkpoint(),
            None => Ok(()),
        }
    }

    fn block(&mut self, statements: &[Stmt]) -> Result<Value, SandboxError> {
        let mut last = Value::Nil;
        for statement in statements {
            last = self.statement(statement)?;
        }
        Ok(last)
    }

    fn statement(&mut self, statement: &Stmt) -> Result<Value, SandboxError> {
        match statement {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                self.store(name.clone(), value.clone());
                Ok(value)
            }
            Stmt::Assign(name, expr) => {
                if !self.variables.contains_key(name) {
                    return Err(SandboxError::runtime(format!(
                        "undefined variable '{name}' (declare it with 'let')"
                    )));
                }
                let value = self.eval(expr)?;
                self.store(name.clone(), value.clone());
                Ok(value)
            }
            Stmt::Repeat { count, body } => {
                let count = match self.eval(count)? {
                    Value::Number(n) if n >= 0.0 => n as u64,
                    other => {
                        return Err(SandboxError::runtime(format!(
                            "repeat count must be a non-negative number, got {}",
                            other.kind()
                        )))
                    }
                };
                let mut last = Value::Nil;
                for _ in 0..count {
                    self.checkpoint()?;
                    last = self.block(body)?;
                }
                Ok(last)
            }
            Stmt::Expr(expr) => self.eval(expr),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self.variables.get(name).cloned().ok_or_else(|| {
                SandboxError::runtime(format!("undefined local variable or method '{name}'"))
            }),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, SandboxError> {
        if let Some(gate) = self.gate {
            gate.guard(name)?;
        }
        let guard = self.guard;
        let _frame = guard.map(ExecutionGuard::enter).transpose()?;

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        self.checkpoint()?;
        dispatch::perform(name, values, &mut self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::method_gate::Posture;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> Result<Value, SandboxError> {
        let gate = MethodGate::new(Posture::Standard);
        let script = parse(source)?;
        let mut interpreter = Interpreter::new(Some(&gate), None);
        interpreter.bind("data", Value::from(vec![1.0, 2.0, 3.0, 4.0]));
        interpreter.run(&script)
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(run("1 + 2 * 3").unwrap(), Value::Number(7.0));
        assert_eq!(run("(1 + 2) * 3").unwrap(), Value::Number(9.0));
        assert_eq!(run("-2 ** 2").unwrap(), Value::Number(-4.0));
        assert_eq!(run("2 ** 3 ** 2").unwrap(), Value::Number(512.0));
        assert_eq!(run("10 - 4 - 3").unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_variables_and_loops() {
        let source = "
            # count to five
            let total = 0;
            repeat 5 { total = total + 1; }
            total
        ";
        assert_eq!(run(source).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn test_method_form_passes_receiver_first() {
        assert_eq!(run("data.mean()").unwrap(), Value::Number(2.5));
        assert_eq!(run("data.sum").unwrap(), Value::Number(10.0));
        assert_eq!(run("data.take(2).reverse()").unwrap(), Value::from(vec![2.0, 1.0]));
    }

    #[test]
    fn test_map_literal_result() {
        let value = run(r#"{"mean": mean(data), count: data.len()}"#).unwrap();
        assert_eq!(value.to_string(), "{count: 4, mean: 2.5}");
    }

    #[test]
    fn test_forbidden_call_is_security_error() {
        let err = run("system('rm -rf /')").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_assignment_requires_declaration() {
        let err = run("x = 1").unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        let err = parse("let x = ;").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { line: 1, column: 9, .. }), "{err:?}");

        let err = parse("let a = 1;\nlet b = 'open").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { line: 2, column: 9, .. }), "{err:?}");

        assert!(parse("repeat 3 { 1 ").is_err());
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_excessive_nesting_rejected() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nesting deeper than"));

        let shallow = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn test_ungated_interpreter_allows_output() {
        let script = parse("puts('hi'); 1").unwrap();
        let mut interpreter = Interpreter::new(None, None);
        assert_eq!(interpreter.run(&script).unwrap(), Value::Number(1.0));
        assert_eq!(interpreter.into_output(), "hi\n");
    }
}
