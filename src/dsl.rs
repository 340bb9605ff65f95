//! DSL 表达式求值
//!
//! 支持对 `status_code`、`body` 等响应变量的布尔表达式，例如
//! `status_code == 200 && contains(body, "admin")`。内置函数有
//! `contains`、`regex`、`len`、`to_lower`。求值结果必须是布尔值。

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::template::VarValue;

/// 全局表达式缓存
static EXPRESSION_CACHE: Lazy<RwLock<HashMap<String, Arc<AstNode>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// 编译表达式，已编译过的直接从缓存返回
pub fn compile(expression: &str) -> Result<Arc<AstNode>> {
    if let Some(ast) = EXPRESSION_CACHE.read().get(expression) {
        return Ok(ast.clone());
    }

    let lexer = Lexer::new(expression);
    let mut parser = Parser::new(lexer)?;
    let ast = Arc::new(parser.parse()?);
    if parser.current_token != Token::Eof {
        return Err(anyhow!("表达式末尾存在多余内容: {:?}", parser.current_token));
    }

    EXPRESSION_CACHE.write().insert(expression.to_string(), ast.clone());
    Ok(ast)
}

/// DSL值
#[derive(Debug, Clone, PartialEq)]
pub enum DslValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Float(f64),
}

impl fmt::Display for DslValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DslValue::String(s) => write!(f, "{}", s),
            DslValue::Integer(i) => write!(f, "{}", i),
            DslValue::Boolean(b) => write!(f, "{}", b),
            DslValue::Float(fl) => write!(f, "{}", fl),
        }
    }
}

impl DslValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            DslValue::Integer(i) => Some(*i as f64),
            DslValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            DslValue::Boolean(b) => Ok(*b),
            other => Err(anyhow!("期望布尔值，但得到 {:?}", other)),
        }
    }
}

/// Token类型枚举
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    StringLiteral(String),
    IntegerLiteral(i64),
    FloatLiteral(f64),
    BooleanLiteral(bool),
    LeftParen,
    RightParen,
    Comma,
    And,
    Or,
    Not,
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Plus,
    Minus,
    Eof,
}

/// 词法分析器
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current_char = chars.first().copied();

        Lexer {
            input: chars,
            position: 0,
            current_char,
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    /// 读取字符串字面量，支持单双引号
    fn read_string(&mut self, quote: char) -> Result<String> {
        let mut result = String::new();
        self.advance(); // 跳过开始的引号

        while let Some(ch) = self.current_char {
            if ch == quote {
                self.advance();
                return Ok(result);
            } else if ch == '\\' {
                self.advance();
                match self.current_char {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('r') => result.push('\r'),
                    Some(c) => result.push(c),
                    None => return Err(anyhow!("字符串字面量中的转义序列不完整")),
                }
                self.advance();
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err(anyhow!("未终止的字符串字面量"))
    }

    fn read_number(&mut self) -> Result<Token> {
        let mut result = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                result.push(ch);
                self.advance();
            } else if ch == '.' && !is_float {
                is_float = true;
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if is_float {
            result.parse().map(Token::FloatLiteral).map_err(|e| anyhow!("无效的数字 {}: {}", result, e))
        } else {
            result.parse().map(Token::IntegerLiteral).map_err(|e| anyhow!("无效的数字 {}: {}", result, e))
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut result = String::new();

        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match result.as_str() {
            "true" => Token::BooleanLiteral(true),
            "false" => Token::BooleanLiteral(false),
            _ => Token::Identifier(result),
        }
    }

    /// 读取一个双字符运算符的第二个字符
    fn follow(&mut self, next: char, matched: Token, single: Option<Token>, ch: char) -> Result<Token> {
        self.advance();
        if self.current_char == Some(next) {
            self.advance();
            return Ok(matched);
        }
        single.ok_or_else(|| anyhow!("意外的字符: {}", ch))
    }

    pub fn next_token(&mut self) -> Result<Token> {
        while matches!(self.current_char, Some(ch) if ch.is_whitespace()) {
            self.advance();
        }

        let ch = match self.current_char {
            None => return Ok(Token::Eof),
            Some(ch) => ch,
        };

        match ch {
            '"' | '\'' => Ok(Token::StringLiteral(self.read_string(ch)?)),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier()),
            '(' => {
                self.advance();
                Ok(Token::LeftParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RightParen)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            '+' => {
                self.advance();
                Ok(Token::Plus)
            }
            '-' => {
                self.advance();
                Ok(Token::Minus)
            }
            '&' => self.follow('&', Token::And, None, ch),
            '|' => self.follow('|', Token::Or, None, ch),
            '=' => self.follow('=', Token::Equal, None, ch),
            '!' => self.follow('=', Token::NotEqual, Some(Token::Not), ch),
            '<' => self.follow('=', Token::LessEqual, Some(Token::LessThan), ch),
            '>' => self.follow('=', Token::GreaterEqual, Some(Token::GreaterThan), ch),
            other => Err(anyhow!("意外的字符: {}", other)),
        }
    }
}

/// 抽象语法树节点
#[derive(Debug, Clone)]
pub enum AstNode {
    Literal(DslValue),
    Variable(String),
    FunctionCall { name: String, args: Vec<AstNode> },
    BinaryOp { left: Box<AstNode>, operator: BinaryOperator, right: Box<AstNode> },
    Not(Box<AstNode>),
    Negate(Box<AstNode>),
}

#[derive(Debug, Clone, Copy)]
pub enum BinaryOperator {
    And,
    Or,
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Add,
    Subtract,
}

/// 语法分析器
pub struct Parser {
    lexer: Lexer,
    current_token: Token,
}

impl Parser {
    pub fn new(mut lexer: Lexer) -> Result<Self> {
        let current_token = lexer.next_token()?;
        Ok(Parser { lexer, current_token })
    }

    fn advance(&mut self) -> Result<()> {
        self.current_token = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.current_token == expected {
            self.advance()
        } else {
            Err(anyhow!("期望 {:?}, 但得到 {:?}", expected, self.current_token))
        }
    }

    pub fn parse(&mut self) -> Result<AstNode> {
        self.parse_or_expression()
    }

    fn binary(left: AstNode, operator: BinaryOperator, right: AstNode) -> AstNode {
        AstNode::BinaryOp {
            left: Box::new(left),
            operator,
            right: Box::new(right),
        }
    }

    fn parse_or_expression(&mut self) -> Result<AstNode> {
        let mut left = self.parse_and_expression()?;
        while self.current_token == Token::Or {
            self.advance()?;
            let right = self.parse_and_expression()?;
            left = Self::binary(left, BinaryOperator::Or, right);
        }
        Ok(left)
    }

    fn parse_and_expression(&mut self) -> Result<AstNode> {
        let mut left = self.parse_equality_expression()?;
        while self.current_token == Token::And {
            self.advance()?;
            let right = self.parse_equality_expression()?;
            left = Self::binary(left, BinaryOperator::And, right);
        }
        Ok(left)
    }

    fn parse_equality_expression(&mut self) -> Result<AstNode> {
        let mut left = self.parse_relational_expression()?;
        loop {
            let operator = match self.current_token {
                Token::Equal => BinaryOperator::Equal,
                Token::NotEqual => BinaryOperator::NotEqual,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_relational_expression()?;
            left = Self::binary(left, operator, right);
        }
        Ok(left)
    }

    fn parse_relational_expression(&mut self) -> Result<AstNode> {
        let mut left = self.parse_additive_expression()?;
        loop {
            let operator = match self.current_token {
                Token::LessThan => BinaryOperator::LessThan,
                Token::LessEqual => BinaryOperator::LessEqual,
                Token::GreaterThan => BinaryOperator::GreaterThan,
                Token::GreaterEqual => BinaryOperator::GreaterEqual,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_additive_expression()?;
            left = Self::binary(left, operator, right);
        }
        Ok(left)
    }

    fn parse_additive_expression(&mut self) -> Result<AstNode> {
        let mut left = self.parse_unary_expression()?;
        loop {
            let operator = match self.current_token {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Subtract,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary_expression()?;
            left = Self::binary(left, operator, right);
        }
        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> Result<AstNode> {
        match self.current_token {
            Token::Not => {
                self.advance()?;
                Ok(AstNode::Not(Box::new(self.parse_unary_expression()?)))
            }
            Token::Minus => {
                self.advance()?;
                Ok(AstNode::Negate(Box::new(self.parse_unary_expression()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<AstNode> {
        let node = match &self.current_token {
            Token::StringLiteral(s) => AstNode::Literal(DslValue::String(s.clone())),
            Token::IntegerLiteral(i) => AstNode::Literal(DslValue::Integer(*i)),
            Token::FloatLiteral(f) => AstNode::Literal(DslValue::Float(*f)),
            Token::BooleanLiteral(b) => AstNode::Literal(DslValue::Boolean(*b)),
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance()?;

                if self.current_token != Token::LeftParen {
                    return Ok(AstNode::Variable(name));
                }

                // 函数调用
                self.advance()?;
                let mut args = Vec::new();
                if self.current_token != Token::RightParen {
                    loop {
                        args.push(self.parse_or_expression()?);
                        if self.current_token == Token::Comma {
                            self.advance()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RightParen)?;
                return Ok(AstNode::FunctionCall { name, args });
            }
            Token::LeftParen => {
                self.advance()?;
                let expr = self.parse_or_expression()?;
                self.expect(Token::RightParen)?;
                return Ok(expr);
            }
            other => return Err(anyhow!("意外的token: {:?}", other)),
        };
        self.advance()?;
        Ok(node)
    }
}

/// DSL 求值器，持有响应变量
#[derive(Debug, Clone, Default)]
pub struct DslEvaluator {
    variables: HashMap<String, DslValue>,
}

impl DslEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从响应构造求值器：status_code、body、content_length、all_headers
    pub fn from_response(status_code: Option<u16>, body: &str, headers: &str) -> Self {
        let mut evaluator = Self::new();
        if let Some(status) = status_code {
            evaluator.set_variable("status_code", DslValue::Integer(i64::from(status)));
        }
        evaluator.set_variable("body", DslValue::String(body.to_string()));
        evaluator.set_variable("content_length", DslValue::Integer(body.len() as i64));
        evaluator.set_variable("all_headers", DslValue::String(headers.to_string()));
        evaluator
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: DslValue) {
        self.variables.insert(name.into(), value);
    }

    /// 把作用域中的变量作为字符串暴露给表达式，同名响应变量优先
    pub fn with_scope(mut self, scope: &HashMap<String, VarValue>) -> Self {
        for (name, value) in scope {
            self.variables
                .entry(name.clone())
                .or_insert_with(|| DslValue::String(value.render()));
        }
        self
    }

    /// 求值表达式，结果不是布尔值时返回错误
    pub fn evaluate_bool(&self, expression: &str) -> Result<bool> {
        let ast = compile(expression)?;
        self.evaluate(&ast)?.as_bool()
    }

    pub fn evaluate(&self, node: &AstNode) -> Result<DslValue> {
        match node {
            AstNode::Literal(value) => Ok(value.clone()),
            AstNode::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("未定义的变量: {}", name)),
            AstNode::FunctionCall { name, args } => {
                let values = args.iter().map(|arg| self.evaluate(arg)).collect::<Result<Vec<_>>>()?;
                call_function(name, &values)
            }
            AstNode::Not(operand) => Ok(DslValue::Boolean(!self.evaluate(operand)?.as_bool()?)),
            AstNode::Negate(operand) => match self.evaluate(operand)? {
                DslValue::Integer(i) => i
                    .checked_neg()
                    .map(DslValue::Integer)
                    .ok_or_else(|| anyhow!("整数取负溢出: {}", i)),
                DslValue::Float(f) => Ok(DslValue::Float(-f)),
                other => Err(anyhow!("无法对 {:?} 应用负号操作", other)),
            },
            AstNode::BinaryOp { left, operator, right } => match operator {
                BinaryOperator::And => {
                    if !self.evaluate(left)?.as_bool()? {
                        return Ok(DslValue::Boolean(false));
                    }
                    Ok(DslValue::Boolean(self.evaluate(right)?.as_bool()?))
                }
                BinaryOperator::Or => {
                    if self.evaluate(left)?.as_bool()? {
                        return Ok(DslValue::Boolean(true));
                    }
                    Ok(DslValue::Boolean(self.evaluate(right)?.as_bool()?))
                }
                _ => {
                    let l = self.evaluate(left)?;
                    let r = self.evaluate(right)?;
                    evaluate_binary_op(&l, *operator, &r)
                }
            },
        }
    }
}

fn evaluate_binary_op(left: &DslValue, operator: BinaryOperator, right: &DslValue) -> Result<DslValue> {
    match operator {
        BinaryOperator::Equal => Ok(DslValue::Boolean(values_equal(left, right))),
        BinaryOperator::NotEqual => Ok(DslValue::Boolean(!values_equal(left, right))),
        BinaryOperator::LessThan => compare_values(left, right, |a, b| a < b),
        BinaryOperator::LessEqual => compare_values(left, right, |a, b| a <= b),
        BinaryOperator::GreaterThan => compare_values(left, right, |a, b| a > b),
        BinaryOperator::GreaterEqual => compare_values(left, right, |a, b| a >= b),
        BinaryOperator::Add => match (left, right) {
            (DslValue::Integer(a), DslValue::Integer(b)) => a
                .checked_add(*b)
                .map(DslValue::Integer)
                .ok_or_else(|| anyhow!("整数加法溢出: {} + {}", a, b)),
            (DslValue::String(a), DslValue::String(b)) => Ok(DslValue::String(format!("{}{}", a, b))),
            _ => arithmetic(left, right, |a, b| a + b),
        },
        BinaryOperator::Subtract => match (left, right) {
            (DslValue::Integer(a), DslValue::Integer(b)) => a
                .checked_sub(*b)
                .map(DslValue::Integer)
                .ok_or_else(|| anyhow!("整数减法溢出: {} - {}", a, b)),
            _ => arithmetic(left, right, |a, b| a - b),
        },
        BinaryOperator::And | BinaryOperator::Or => Err(anyhow!("逻辑运算符必须短路求值")),
    }
}

fn values_equal(left: &DslValue, right: &DslValue) -> bool {
    match (left, right) {
        (DslValue::String(a), DslValue::String(b)) => a == b,
        (DslValue::Boolean(a), DslValue::Boolean(b)) => a == b,
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
    }
}

fn compare_values<F>(left: &DslValue, right: &DslValue, op: F) -> Result<DslValue>
where
    F: Fn(f64, f64) -> bool,
{
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(DslValue::Boolean(op(a, b))),
        _ => Err(anyhow!("无法比较非数值类型: {:?} 与 {:?}", left, right)),
    }
}

fn arithmetic<F>(left: &DslValue, right: &DslValue, op: F) -> Result<DslValue>
where
    F: Fn(f64, f64) -> f64,
{
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(DslValue::Float(op(a, b))),
        _ => Err(anyhow!("无法对非数值类型执行算术操作")),
    }
}

fn string_arg<'a>(name: &str, args: &'a [DslValue], index: usize) -> Result<&'a str> {
    match args.get(index) {
        Some(DslValue::String(s)) => Ok(s.as_str()),
        Some(other) => Err(anyhow!("{}: 第{}个参数应为字符串，但得到 {:?}", name, index + 1, other)),
        None => Err(anyhow!("{}: 缺少第{}个参数", name, index + 1)),
    }
}

fn expect_arity(name: &str, args: &[DslValue], arity: usize) -> Result<()> {
    if args.len() != arity {
        return Err(anyhow!("{} 需要 {} 个参数，但得到 {}", name, arity, args.len()));
    }
    Ok(())
}

/// 调用内置函数
fn call_function(name: &str, args: &[DslValue]) -> Result<DslValue> {
    match name {
        "contains" => {
            expect_arity(name, args, 2)?;
            let haystack = string_arg(name, args, 0)?;
            let needle = string_arg(name, args, 1)?;
            Ok(DslValue::Boolean(haystack.contains(needle)))
        }
        "regex" => {
            expect_arity(name, args, 2)?;
            let pattern = string_arg(name, args, 0)?;
            let subject = string_arg(name, args, 1)?;
            let re = Regex::new(pattern).map_err(|e| anyhow!("无效的正则表达式 {}: {}", pattern, e))?;
            Ok(DslValue::Boolean(re.is_match(subject)))
        }
        "len" => {
            expect_arity(name, args, 1)?;
            Ok(DslValue::Integer(string_arg(name, args, 0)?.chars().count() as i64))
        }
        "to_lower" | "tolower" => {
            expect_arity(name, args, 1)?;
            Ok(DslValue::String(string_arg(name, args, 0)?.to_lowercase()))
        }
        _ => Err(anyhow!("未知的函数: {}", name)),
    }
}
