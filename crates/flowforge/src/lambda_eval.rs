//! A restricted expression language for `lambda:` declarations.
//!
//! The grammar intentionally covers only: literals, names, attribute access,
//! subscripts, tuples/lists/dicts/sets, `==`/`!=`, `+` over literals,
//! comprehensions, and calls to an explicit safe set (`range`). Anything
//! outside that whitelist fails to parse rather than silently degrading, so
//! the dependency walker (which reuses this same parser) can never be fooled
//! into missing a dependency that the evaluator would happily execute.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Attribute(Box<Expr>, String),
    Subscript(Box<Expr>, Box<Expr>),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Comprehension {
        kind: CompKind,
        element: Box<Expr>,
        value: Option<Box<Expr>>, // dict comprehension value half
        target: String,
        iter: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

/// Parses `source` into a restricted AST, rejecting anything outside the
/// whitelist described at module level.
pub fn parse(source: &str) -> Result<Expr, Error> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Collects the free (unbound) names referenced by `expr`, excluding
/// comprehension targets and the `range` builtin.
pub fn free_names(expr: &Expr) -> HashSet<String> {
    let mut names = HashSet::new();
    collect_names(expr, &mut Vec::new(), &mut names);
    names
}

fn collect_names(expr: &Expr, bound: &mut Vec<String>, out: &mut HashSet<String>) {
    match expr {
        Expr::Name(n) => {
            if !bound.contains(n) {
                out.insert(n.clone());
            }
        }
        Expr::Attribute(base, _) => collect_names(base, bound, out),
        Expr::Subscript(base, idx) => {
            collect_names(base, bound, out);
            collect_names(idx, bound, out);
        }
        Expr::Tuple(items) | Expr::List(items) | Expr::Set(items) => {
            for item in items {
                collect_names(item, bound, out);
            }
        }
        Expr::Dict(items) => {
            for (k, v) in items {
                collect_names(k, bound, out);
                collect_names(v, bound, out);
            }
        }
        Expr::Compare(a, _, b) | Expr::Add(a, b) => {
            collect_names(a, bound, out);
            collect_names(b, bound, out);
        }
        Expr::Call(_, args) => {
            for a in args {
                collect_names(a, bound, out);
            }
        }
        Expr::Comprehension {
            element,
            value,
            target,
            iter,
            condition,
            ..
        } => {
            collect_names(iter, bound, out);
            bound.push(target.clone());
            collect_names(element, bound, out);
            if let Some(v) = value {
                collect_names(v, bound, out);
            }
            if let Some(c) = condition {
                collect_names(c, bound, out);
            }
            bound.pop();
        }
        Expr::None | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
    }
}

/// Evaluates `expr` against a variable context, yielding a JSON value.
pub fn eval(expr: &Expr, ctx: &HashMap<String, Value>) -> Result<Value, Error> {
    match expr {
        Expr::None => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::from(*i)),
        Expr::Float(f) => Ok(Value::from(*f)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Name(n) => ctx
            .get(n)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(n.clone())),
        Expr::Attribute(base, attr) => {
            let v = eval(base, ctx)?;
            v.get(attr)
                .cloned()
                .ok_or_else(|| Error::InvalidExpression(format!("no attribute '{attr}'")))
        }
        Expr::Subscript(base, idx) => {
            let v = eval(base, ctx)?;
            let i = eval(idx, ctx)?;
            index_value(&v, &i)
        }
        Expr::Tuple(items) | Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Set(items) => {
            let mut out = Vec::new();
            for item in items {
                let v = eval(item, ctx)?;
                if !out.contains(&v) {
                    out.push(v);
                }
            }
            Ok(Value::Array(out))
        }
        Expr::Dict(items) => {
            let mut map = serde_json::Map::new();
            for (k, v) in items {
                let key = eval(k, ctx)?;
                let key = value_to_key(&key)?;
                map.insert(key, eval(v, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Compare(a, op, b) => {
            let va = eval(a, ctx)?;
            let vb = eval(b, ctx)?;
            let eq = va == vb;
            Ok(Value::Bool(match op {
                CompareOp::Eq => eq,
                CompareOp::NotEq => !eq,
            }))
        }
        Expr::Add(a, b) => {
            let va = eval(a, ctx)?;
            let vb = eval(b, ctx)?;
            add_values(va, vb)
        }
        Expr::Call(name, args) => {
            if name != "range" {
                return Err(Error::InvalidExpression(format!("call to '{name}' is not permitted")));
            }
            let nums: Vec<i64> = args
                .iter()
                .map(|a| eval(a, ctx).and_then(|v| as_i64(&v)))
                .collect::<Result<_, _>>()?;
            let range: Vec<Value> = match nums.as_slice() {
                [stop] => (0..*stop).map(Value::from).collect(),
                [start, stop] => (*start..*stop).map(Value::from).collect(),
                [start, stop, step] if *step != 0 => {
                    let mut out = Vec::new();
                    let mut cur = *start;
                    if *step > 0 {
                        while cur < *stop {
                            out.push(Value::from(cur));
                            cur += step;
                        }
                    } else {
                        while cur > *stop {
                            out.push(Value::from(cur));
                            cur += step;
                        }
                    }
                    out
                }
                _ => return Err(Error::InvalidExpression("invalid range() arguments".into())),
            };
            Ok(Value::Array(range))
        }
        Expr::Comprehension {
            kind,
            element,
            value,
            target,
            iter,
            condition,
        } => {
            let iterable = eval(iter, ctx)?;
            let items = as_iterable(&iterable)?;
            let mut results_list = Vec::new();
            let mut results_map = serde_json::Map::new();
            for item in items {
                let mut scoped = ctx.clone();
                scoped.insert(target.clone(), item);
                if let Some(cond) = condition {
                    if !is_truthy(&eval(cond, &scoped)?) {
                        continue;
                    }
                }
                let elem = eval(element, &scoped)?;
                match kind {
                    CompKind::Dict => {
                        let val = eval(value.as_ref().expect("dict comprehension has value"), &scoped)?;
                        results_map.insert(value_to_key(&elem)?, val);
                    }
                    CompKind::Set => {
                        if !results_list.contains(&elem) {
                            results_list.push(elem);
                        }
                    }
                    CompKind::List | CompKind::Generator => {
                        results_list.push(elem);
                    }
                }
            }
            match kind {
                CompKind::Dict => Ok(Value::Object(results_map)),
                _ => Ok(Value::Array(results_list)),
            }
        }
    }
}

fn value_to_key(v: &Value) -> Result<String, Error> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

fn as_i64(v: &Value) -> Result<i64, Error> {
    v.as_i64()
        .ok_or_else(|| Error::InvalidExpression("expected integer".into()))
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_iterable(v: &Value) -> Result<Vec<Value>, Error> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        other => Err(Error::NotIterable(other.to_string())),
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, Error> {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| Error::InvalidExpression("expected integer index".into()))?;
            let len = items.len() as i64;
            let idx = if i < 0 { i + len } else { i };
            items
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| Error::InvalidExpression("index out of range".into()))
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| Error::InvalidExpression(format!("no key '{key}'"))),
        _ => Err(Error::InvalidExpression("unsupported subscript".into())),
    }
}

fn add_values(a: Value, b: Value) -> Result<Value, Error> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                Ok(Value::from(a + b))
            } else {
                Ok(Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)))
            }
        }
        (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (a, b) => Err(Error::InvalidExpression(format!(
            "unsupported operand types for +: {a} and {b}"
        ))),
    }
}

// --- tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Sym(char),
    EqEq,
    NotEq,
    For,
    In,
    If,
    None,
    True,
    False,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != quote {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(Error::InvalidExpression("unterminated string literal".into()));
            }
            i += 1;
            tokens.push(Token::Str(s));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            if s.contains('.') {
                tokens.push(Token::Float(s.parse().map_err(|_| {
                    Error::InvalidExpression(format!("invalid number literal '{s}'"))
                })?));
            } else {
                tokens.push(Token::Int(s.parse().map_err(|_| {
                    Error::InvalidExpression(format!("invalid number literal '{s}'"))
                })?));
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            tokens.push(match s.as_str() {
                "for" => Token::For,
                "in" => Token::In,
                "if" => Token::If,
                "None" => Token::None,
                "True" => Token::True,
                "False" => Token::False,
                _ => Token::Ident(s),
            });
            continue;
        }
        if c == '=' && chars.get(i + 1) == Some(&'=') {
            tokens.push(Token::EqEq);
            i += 2;
            continue;
        }
        if c == '!' && chars.get(i + 1) == Some(&'=') {
            tokens.push(Token::NotEq);
            i += 2;
            continue;
        }
        if "()[]{},.:+".contains(c) {
            tokens.push(Token::Sym(c));
            i += 1;
            continue;
        }
        return Err(Error::InvalidExpression(format!("unexpected character '{c}'")));
    }
    Ok(tokens)
}

// --- recursive-descent parser ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_sym(&mut self, c: char) -> Result<(), Error> {
        match self.bump() {
            Some(Token::Sym(s)) if s == c => Ok(()),
            other => Err(Error::InvalidExpression(format!(
                "expected '{c}', found {other:?}"
            ))),
        }
    }

    fn expect_end(&self) -> Result<(), Error> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(Error::InvalidExpression("trailing tokens after expression".into()))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, Error> {
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, Error> {
        let lhs = self.parse_add()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.bump();
                let rhs = self.parse_add()?;
                Ok(Expr::Compare(Box::new(lhs), CompareOp::Eq, Box::new(rhs)))
            }
            Some(Token::NotEq) => {
                self.bump();
                let rhs = self.parse_add()?;
                Ok(Expr::Compare(Box::new(lhs), CompareOp::NotEq, Box::new(rhs)))
            }
            _ => Ok(lhs),
        }
    }

    fn parse_add(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.parse_postfix()?;
        while let Some(Token::Sym('+')) = self.peek() {
            self.bump();
            let rhs = self.parse_postfix()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr, Error> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(Token::Sym('.')) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Attribute(Box::new(expr), name);
                        }
                        other => {
                            return Err(Error::InvalidExpression(format!(
                                "expected attribute name, found {other:?}"
                            )))
                        }
                    }
                }
                Some(Token::Sym('[')) => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect_sym(']')?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr, Error> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Float(f)) => Ok(Expr::Float(f)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::None) => Ok(Expr::None),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => {
                if let Some(Token::Sym('(')) = self.peek() {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::Sym(')'))) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Token::Sym(','))) {
                            self.bump();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect_sym(')')?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Some(Token::Sym('(')) => {
                if matches!(self.peek(), Some(Token::Sym(')'))) {
                    self.bump();
                    return Ok(Expr::Tuple(vec![]));
                }
                let first = self.parse_expr()?;
                if matches!(self.peek(), Some(Token::Sym(','))) {
                    let mut items = vec![first];
                    while matches!(self.peek(), Some(Token::Sym(','))) {
                        self.bump();
                        if matches!(self.peek(), Some(Token::Sym(')'))) {
                            break;
                        }
                        items.push(self.parse_expr()?);
                    }
                    self.expect_sym(')')?;
                    Ok(Expr::Tuple(items))
                } else {
                    self.expect_sym(')')?;
                    Ok(first)
                }
            }
            Some(Token::Sym('[')) => self.parse_bracketed_collection(),
            Some(Token::Sym('{')) => self.parse_braced_collection(),
            other => Err(Error::InvalidExpression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn parse_comprehension_tail(&mut self) -> Result<(String, Expr, Option<Expr>), Error> {
        self.bump(); // `for`
        let target = match self.bump() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(Error::InvalidExpression(format!(
                    "expected comprehension target, found {other:?}"
                )))
            }
        };
        match self.bump() {
            Some(Token::In) => {}
            other => {
                return Err(Error::InvalidExpression(format!(
                    "expected 'in', found {other:?}"
                )))
            }
        }
        let iter = self.parse_add()?;
        let condition = if matches!(self.peek(), Some(Token::If)) {
            self.bump();
            Some(self.parse_compare()?)
        } else {
            None
        };
        Ok((target, iter, condition))
    }

    fn parse_bracketed_collection(&mut self) -> Result<Expr, Error> {
        if matches!(self.peek(), Some(Token::Sym(']'))) {
            self.bump();
            return Ok(Expr::List(vec![]));
        }
        let first = self.parse_expr()?;
        if matches!(self.peek(), Some(Token::For)) {
            let (target, iter, condition) = self.parse_comprehension_tail()?;
            self.expect_sym(']')?;
            return Ok(Expr::Comprehension {
                kind: CompKind::List,
                element: Box::new(first),
                value: None,
                target,
                iter: Box::new(iter),
                condition: condition.map(Box::new),
            });
        }
        let mut items = vec![first];
        while matches!(self.peek(), Some(Token::Sym(','))) {
            self.bump();
            if matches!(self.peek(), Some(Token::Sym(']'))) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect_sym(']')?;
        Ok(Expr::List(items))
    }

    fn parse_braced_collection(&mut self) -> Result<Expr, Error> {
        if matches!(self.peek(), Some(Token::Sym('}'))) {
            self.bump();
            return Ok(Expr::Dict(vec![]));
        }
        let first = self.parse_expr()?;
        if matches!(self.peek(), Some(Token::Sym(':'))) {
            self.bump();
            let first_val = self.parse_expr()?;
            if matches!(self.peek(), Some(Token::For)) {
                let (target, iter, condition) = self.parse_comprehension_tail()?;
                self.expect_sym('}')?;
                return Ok(Expr::Comprehension {
                    kind: CompKind::Dict,
                    element: Box::new(first),
                    value: Some(Box::new(first_val)),
                    target,
                    iter: Box::new(iter),
                    condition: condition.map(Box::new),
                });
            }
            let mut pairs = vec![(first, first_val)];
            while matches!(self.peek(), Some(Token::Sym(','))) {
                self.bump();
                if matches!(self.peek(), Some(Token::Sym('}'))) {
                    break;
                }
                let k = self.parse_expr()?;
                self.expect_sym(':')?;
                let v = self.parse_expr()?;
                pairs.push((k, v));
            }
            self.expect_sym('}')?;
            return Ok(Expr::Dict(pairs));
        }
        if matches!(self.peek(), Some(Token::For)) {
            let (target, iter, condition) = self.parse_comprehension_tail()?;
            self.expect_sym('}')?;
            return Ok(Expr::Comprehension {
                kind: CompKind::Set,
                element: Box::new(first),
                value: None,
                target,
                iter: Box::new(iter),
                condition: condition.map(Box::new),
            });
        }
        let mut items = vec![first];
        while matches!(self.peek(), Some(Token::Sym(','))) {
            self.bump();
            if matches!(self.peek(), Some(Token::Sym('}'))) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect_sym('}')?;
        Ok(Expr::Set(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_attribute_and_add() {
        let expr = parse("\"My name is \" + name + \". age \" + age").unwrap();
        let mut ctx = HashMap::new();
        ctx.insert("name".to_string(), json!("Ada"));
        ctx.insert("age".to_string(), json!("36"));
        let result = eval(&expr, &ctx).unwrap();
        assert_eq!(result, json!("My name is Ada. age 36"));
    }

    #[test]
    fn list_comprehension_excludes_bound_target() {
        let expr = parse("[item for item in items if item != 'foo']").unwrap();
        let names = free_names(&expr);
        assert!(names.contains("items"));
        assert!(!names.contains("item"));

        let mut ctx = HashMap::new();
        ctx.insert("items".to_string(), json!(["foo", "bar", "baz"]));
        let result = eval(&expr, &ctx).unwrap();
        assert_eq!(result, json!(["bar", "baz"]));
    }

    #[test]
    fn rejects_disallowed_calls() {
        // `open` parses fine as a Call node; only eval rejects it, against
        // the explicit whitelist of permitted callables.
        let expr = parse("open('/etc/passwd')").unwrap();
        let ctx = HashMap::new();
        assert!(eval(&expr, &ctx).is_err());
    }

    #[test]
    fn range_call_three_args() {
        let expr = parse("[x for x in range(0, 6, 2)]").unwrap();
        let ctx = HashMap::new();
        let result = eval(&expr, &ctx).unwrap();
        assert_eq!(result, json!([0, 2, 4]));
    }
}
