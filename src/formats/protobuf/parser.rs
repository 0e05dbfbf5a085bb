//! Lexer and parser for `.proto` IDL (proto2 / proto3)
//!
//! Covers the declarations that matter for validation and evolution checks:
//! syntax, package, imports, messages (fields, maps, oneofs, reserved,
//! nested types, groups), enums and services. Options are parsed only far
//! enough to skip them.

use std::fmt;

use crate::budget::StageBudget;
use crate::error::RuleError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(String),
    Float(String),
    Str(String),
    Symbol(char),
}

impl Token {
    /// Source text of the token, string literals with their quotes
    pub fn text(&self) -> String {
        match self {
            Token::Ident(s) | Token::Int(s) | Token::Float(s) | Token::Str(s) => s.clone(),
            Token::Symbol(c) => c.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl SyntaxError {
    pub fn location(&self) -> String {
        format!("{}:{}", self.line, self.column)
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}, column {}", self.message, self.line, self.column)
    }
}

pub enum ParseFailure {
    Syntax(SyntaxError),
    Exhausted(RuleError),
}

impl From<RuleError> for ParseFailure {
    fn from(e: RuleError) -> Self {
        ParseFailure::Exhausted(e)
    }
}

pub type ParseResult<T> = std::result::Result<T, ParseFailure>;

pub fn tokenize(source: &str) -> std::result::Result<Vec<Spanned>, SyntaxError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let (mut i, mut line, mut column) = (0usize, 1usize, 1usize);

    let advance = |i: &mut usize, line: &mut usize, column: &mut usize, c: char| {
        *i += 1;
        if c == '\n' {
            *line += 1;
            *column = 1;
        } else {
            *column += 1;
        }
    };

    while i < chars.len() {
        let c = chars[i];
        let (start_line, start_column) = (line, column);

        if c.is_whitespace() {
            advance(&mut i, &mut line, &mut column, c);
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                let ch = chars[i];
                advance(&mut i, &mut line, &mut column, ch);
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            advance(&mut i, &mut line, &mut column, '/');
            advance(&mut i, &mut line, &mut column, '*');
            loop {
                if i >= chars.len() {
                    return Err(SyntaxError {
                        message: "Unterminated block comment".to_string(),
                        line: start_line,
                        column: start_column,
                    });
                }
                if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                    advance(&mut i, &mut line, &mut column, '*');
                    advance(&mut i, &mut line, &mut column, '/');
                    break;
                }
                let ch = chars[i];
                advance(&mut i, &mut line, &mut column, ch);
            }
            continue;
        }

        let token = if c.is_ascii_alphabetic() || c == '_' {
            let mut s = String::new();
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                let ch = chars[i];
                s.push(ch);
                advance(&mut i, &mut line, &mut column, ch);
            }
            Token::Ident(s)
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let mut s = String::new();
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                let exponent_sign = (d == '+' || d == '-') && matches!(s.chars().last(), Some('e' | 'E')) && !s.starts_with("0x");
                if d.is_ascii_alphanumeric() || d == '.' || exponent_sign {
                    if d == '.' || ((d == 'e' || d == 'E') && !s.starts_with("0x") && !s.starts_with("0X")) {
                        is_float = true;
                    }
                    s.push(d);
                    advance(&mut i, &mut line, &mut column, d);
                } else {
                    break;
                }
            }
            if is_float {
                Token::Float(s)
            } else {
                Token::Int(s)
            }
        } else if c == '"' || c == '\'' {
            let mut s = String::new();
            s.push(c);
            advance(&mut i, &mut line, &mut column, c);
            loop {
                let Some(&d) = chars.get(i) else {
                    return Err(SyntaxError {
                        message: "Unterminated string literal".to_string(),
                        line: start_line,
                        column: start_column,
                    });
                };
                if d == '\n' {
                    return Err(SyntaxError {
                        message: "Newline in string literal".to_string(),
                        line: start_line,
                        column: start_column,
                    });
                }
                s.push(d);
                advance(&mut i, &mut line, &mut column, d);
                if d == '\\' {
                    if let Some(&escaped) = chars.get(i) {
                        s.push(escaped);
                        advance(&mut i, &mut line, &mut column, escaped);
                    }
                } else if d == c {
                    break;
                }
            }
            Token::Str(s)
        } else if "{}[]()<>;,=.-+:/".contains(c) {
            advance(&mut i, &mut line, &mut column, c);
            Token::Symbol(c)
        } else {
            return Err(SyntaxError {
                message: format!("Unexpected character '{}'", c.escape_default()),
                line,
                column,
            });
        };

        tokens.push(Spanned {
            token,
            line: start_line,
            column: start_column,
        });
    }
    Ok(tokens)
}

/// Unquoted value of a string literal token
pub fn unquote(literal: &str) -> String {
    let inner = if literal.len() >= 2 { &literal[1..literal.len() - 1] } else { literal };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Proto2,
    Proto3,
    Editions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// No label (proto3 singular, oneof members, map fields)
    Singular,
    Optional,
    Required,
    Repeated,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Singular => "singular",
            Label::Optional => "optional",
            Label::Required => "required",
            Label::Repeated => "repeated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Import {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub number: i64,
    pub label: Label,
    /// Type as written; `map<K,V>` for map fields
    pub type_name: String,
    pub map_types: Option<(String, String)>,
    pub oneof: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberRange {
    pub start: i64,
    pub end: i64,
}

impl NumberRange {
    pub fn contains(&self, n: i64) -> bool {
        self.start <= n && n <= self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reserved {
    pub ranges: Vec<NumberRange>,
    pub names: Vec<String>,
}

impl Reserved {
    pub fn number(&self, n: i64) -> bool {
        self.ranges.iter().any(|r| r.contains(n))
    }

    pub fn name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub reserved: Reserved,
    pub messages: Vec<MessageDef>,
    pub enums: Vec<EnumDef>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct EnumValue {
    pub name: String,
    pub number: i64,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<EnumValue>,
    pub reserved: Reserved,
    pub allow_alias: bool,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct RpcDef {
    pub name: String,
    pub input: String,
    pub output: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub name: String,
    pub rpcs: Vec<RpcDef>,
}

#[derive(Debug, Clone)]
pub struct ProtoFile {
    pub syntax: Syntax,
    pub package: Option<String>,
    pub imports: Vec<Import>,
    pub messages: Vec<MessageDef>,
    pub enums: Vec<EnumDef>,
    pub services: Vec<ServiceDef>,
}

pub const FIELD_NUMBER_MAX: i64 = 536_870_911;

pub fn parse(source: &str, budget: &StageBudget) -> ParseResult<ProtoFile> {
    let tokens = tokenize(source).map_err(ParseFailure::Syntax)?;
    Parser { tokens, pos: 0, budget }.file()
}

struct Parser<'b> {
    tokens: Vec<Spanned>,
    pos: usize,
    budget: &'b StageBudget,
}

impl<'b> Parser<'b> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|t| &t.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        let (line, column) = match self.tokens.get(self.pos).or_else(|| self.tokens.last()) {
            Some(t) => (t.line, t.column),
            None => (1, 1),
        };
        Err(ParseFailure::Syntax(SyntaxError {
            message: message.into(),
            line,
            column,
        }))
    }

    fn next(&mut self) -> ParseResult<Token> {
        match self.tokens.get(self.pos) {
            Some(t) => {
                self.pos += 1;
                Ok(t.token.clone())
            }
            None => self.error("Unexpected end of input"),
        }
    }

    fn is_symbol(&self, c: char) -> bool {
        self.peek() == Some(&Token::Symbol(c))
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == keyword)
    }

    fn eat_symbol(&mut self, c: char) -> bool {
        if self.is_symbol(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, c: char) -> ParseResult<()> {
        if self.eat_symbol(c) {
            Ok(())
        } else {
            let found = self.peek().map(Token::text).unwrap_or_else(|| "end of input".to_string());
            self.error(format!("Expected '{}' but found '{}'", c, found))
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.next()? {
            Token::Ident(s) => Ok(s),
            other => {
                self.pos -= 1;
                self.error(format!("Expected identifier but found '{}'", other.text()))
            }
        }
    }

    /// Dotted name, optionally fully qualified with a leading dot
    fn full_ident(&mut self) -> ParseResult<String> {
        let mut name = String::new();
        if self.eat_symbol('.') {
            name.push('.');
        }
        name.push_str(&self.ident()?);
        while self.is_symbol('.') {
            self.pos += 1;
            name.push('.');
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn string(&mut self) -> ParseResult<String> {
        let mut value = match self.next()? {
            Token::Str(s) => unquote(&s),
            other => {
                self.pos -= 1;
                return self.error(format!("Expected string literal but found '{}'", other.text()));
            }
        };
        // adjacent literals concatenate
        while let Some(Token::Str(s)) = self.peek() {
            value.push_str(&unquote(s));
            self.pos += 1;
        }
        Ok(value)
    }

    fn integer(&mut self) -> ParseResult<i64> {
        let negative = self.eat_symbol('-');
        match self.next()? {
            Token::Int(s) => {
                let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    i64::from_str_radix(hex, 16)
                } else if s.len() > 1 && s.starts_with('0') {
                    i64::from_str_radix(&s[1..], 8)
                } else {
                    s.parse::<i64>()
                };
                match parsed {
                    Ok(n) => Ok(if negative { -n } else { n }),
                    Err(_) => {
                        self.pos -= 1;
                        self.error(format!("Invalid integer literal '{}'", s))
                    }
                }
            }
            other => {
                self.pos -= 1;
                self.error(format!("Expected integer but found '{}'", other.text()))
            }
        }
    }

    /// Skip a balanced `{...}`, `[...]`, `(...)` or `<...>` group starting at the current token
    fn skip_balanced(&mut self) -> ParseResult<()> {
        let mut depth = 0usize;
        loop {
            self.budget.check()?;
            match self.next()? {
                Token::Symbol('{' | '[' | '(' | '<') => depth += 1,
                Token::Symbol('}' | ']' | ')' | '>') => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ if depth == 0 => return Ok(()),
                _ => {}
            }
        }
    }

    /// Skip a statement up to and including its `;`, stepping over nested groups
    fn skip_statement(&mut self) -> ParseResult<()> {
        loop {
            self.budget.check()?;
            match self.peek() {
                None => return self.error("Expected ';'"),
                Some(Token::Symbol(';')) => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(Token::Symbol('{' | '[' | '(')) => self.skip_balanced()?,
                Some(Token::Symbol('}')) => return self.error("Unexpected '}'"),
                _ => self.pos += 1,
            }
        }
    }

    fn file(mut self) -> ParseResult<ProtoFile> {
        let mut file = ProtoFile {
            syntax: Syntax::Proto2,
            package: None,
            imports: Vec::new(),
            messages: Vec::new(),
            enums: Vec::new(),
            services: Vec::new(),
        };

        if self.is_keyword("syntax") || self.is_keyword("edition") {
            let keyword = self.ident()?;
            self.expect_symbol('=')?;
            let value = self.string()?;
            self.expect_symbol(';')?;
            file.syntax = match (keyword.as_str(), value.as_str()) {
                ("syntax", "proto2") => Syntax::Proto2,
                ("syntax", "proto3") => Syntax::Proto3,
                ("edition", _) => Syntax::Editions,
                _ => return self.error(format!("Unknown syntax '{}'", value)),
            };
        }

        while self.peek().is_some() {
            self.budget.check()?;
            if self.eat_symbol(';') {
                continue;
            }
            let keyword = self.ident()?;
            match keyword.as_str() {
                "package" => {
                    if file.package.is_some() {
                        return self.error("Multiple package declarations");
                    }
                    file.package = Some(self.full_ident()?);
                    self.expect_symbol(';')?;
                }
                "import" => {
                    if self.is_keyword("public") || self.is_keyword("weak") {
                        self.pos += 1;
                    }
                    let path = self.string()?;
                    self.expect_symbol(';')?;
                    file.imports.push(Import { path });
                }
                "option" => self.skip_statement()?,
                "message" => file.messages.push(self.message(0)?),
                "enum" => file.enums.push(self.enumeration()?),
                "service" => file.services.push(self.service()?),
                "extend" => {
                    self.full_ident()?;
                    self.skip_balanced()?;
                }
                "syntax" | "edition" => return self.error("'syntax' must be the first statement"),
                other => return self.error(format!("Unexpected '{}' at top level", other)),
            }
        }
        Ok(file)
    }

    fn message(&mut self, depth: usize) -> ParseResult<MessageDef> {
        self.budget.check_depth(depth)?;
        let line = self.line();
        let name = self.ident()?;
        self.expect_symbol('{')?;
        let mut message = MessageDef {
            name,
            line,
            ..Default::default()
        };
        self.message_body(&mut message, depth)?;
        Ok(message)
    }

    /// Statements up to and including the closing `}`
    fn message_body(&mut self, message: &mut MessageDef, depth: usize) -> ParseResult<()> {
        loop {
            self.budget.check()?;
            if self.eat_symbol('}') {
                return Ok(());
            }
            if self.eat_symbol(';') {
                continue;
            }
            if self.peek().is_none() {
                return self.error(format!("Unterminated message '{}'", message.name));
            }
            if self.is_symbol('.') {
                let field = self.field(Label::Singular, None)?;
                message.fields.push(field);
                continue;
            }
            let keyword = match self.peek() {
                Some(Token::Ident(s)) => s.clone(),
                Some(other) => {
                    let text = other.text();
                    return self.error(format!("Unexpected '{}' in message '{}'", text, message.name));
                }
                None => unreachable!("checked above"),
            };
            match keyword.as_str() {
                "message" => {
                    self.pos += 1;
                    message.messages.push(self.message(depth + 1)?);
                }
                "enum" => {
                    self.pos += 1;
                    message.enums.push(self.enumeration()?);
                }
                "option" | "extensions" => {
                    self.pos += 1;
                    self.skip_statement()?;
                }
                "extend" => {
                    self.pos += 1;
                    self.full_ident()?;
                    self.skip_balanced()?;
                }
                "reserved" => {
                    self.pos += 1;
                    self.reserved(&mut message.reserved)?;
                }
                "oneof" => {
                    self.pos += 1;
                    let oneof = self.ident()?;
                    self.expect_symbol('{')?;
                    while !self.eat_symbol('}') {
                        self.budget.check()?;
                        if self.peek().is_none() {
                            return self.error(format!("Unterminated oneof '{}'", oneof));
                        }
                        if self.eat_symbol(';') {
                            continue;
                        }
                        if self.is_keyword("option") {
                            self.pos += 1;
                            self.skip_statement()?;
                            continue;
                        }
                        let field = self.field(Label::Singular, Some(oneof.clone()))?;
                        message.fields.push(field);
                    }
                }
                "map" if self.peek_at(1) == Some(&Token::Symbol('<')) => {
                    self.pos += 1;
                    message.fields.push(self.map_field()?);
                }
                "optional" | "required" | "repeated" => {
                    self.pos += 1;
                    let label = match keyword.as_str() {
                        "optional" => Label::Optional,
                        "required" => Label::Required,
                        _ => Label::Repeated,
                    };
                    if self.is_keyword("group") {
                        self.pos += 1;
                        let (field, nested) = self.group(label, depth)?;
                        message.fields.push(field);
                        message.messages.push(nested);
                    } else {
                        message.fields.push(self.field(label, None)?);
                    }
                }
                _ => message.fields.push(self.field(Label::Singular, None)?),
            }
        }
    }

    fn field(&mut self, label: Label, oneof: Option<String>) -> ParseResult<FieldDef> {
        let line = self.line();
        let type_name = self.full_ident()?;
        let name = self.ident()?;
        self.expect_symbol('=')?;
        let number = self.integer()?;
        self.field_options()?;
        self.expect_symbol(';')?;
        Ok(FieldDef {
            name,
            number,
            label,
            type_name,
            map_types: None,
            oneof,
            line,
        })
    }

    fn map_field(&mut self) -> ParseResult<FieldDef> {
        let line = self.line();
        self.expect_symbol('<')?;
        let key = self.full_ident()?;
        self.expect_symbol(',')?;
        let value = self.full_ident()?;
        self.expect_symbol('>')?;
        let name = self.ident()?;
        self.expect_symbol('=')?;
        let number = self.integer()?;
        self.field_options()?;
        self.expect_symbol(';')?;
        Ok(FieldDef {
            name,
            number,
            label: Label::Repeated,
            type_name: format!("map<{},{}>", key, value),
            map_types: Some((key, value)),
            oneof: None,
            line,
        })
    }

    fn group(&mut self, label: Label, depth: usize) -> ParseResult<(FieldDef, MessageDef)> {
        let line = self.line();
        let name = self.ident()?;
        self.expect_symbol('=')?;
        let number = self.integer()?;
        self.field_options()?;
        self.expect_symbol('{')?;
        let mut nested = MessageDef {
            name: name.clone(),
            line,
            ..Default::default()
        };
        self.budget.check_depth(depth + 1)?;
        self.message_body(&mut nested, depth + 1)?;
        let field = FieldDef {
            name: name.to_lowercase(),
            number,
            label,
            type_name: name,
            map_types: None,
            oneof: None,
            line,
        };
        Ok((field, nested))
    }

    fn field_options(&mut self) -> ParseResult<()> {
        if self.is_symbol('[') {
            self.skip_balanced()?;
        }
        Ok(())
    }

    fn reserved(&mut self, reserved: &mut Reserved) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some(Token::Str(_)) => reserved.names.push(self.string()?),
                Some(Token::Ident(_)) => reserved.names.push(self.ident()?),
                _ => {
                    let start = self.integer()?;
                    let end = if self.is_keyword("to") {
                        self.pos += 1;
                        if self.is_keyword("max") {
                            self.pos += 1;
                            FIELD_NUMBER_MAX
                        } else {
                            self.integer()?
                        }
                    } else {
                        start
                    };
                    reserved.ranges.push(NumberRange { start, end });
                }
            }
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(';')
    }

    fn enumeration(&mut self) -> ParseResult<EnumDef> {
        let line = self.line();
        let name = self.ident()?;
        self.expect_symbol('{')?;
        let mut def = EnumDef {
            name,
            line,
            ..Default::default()
        };
        loop {
            self.budget.check()?;
            if self.eat_symbol('}') {
                return Ok(def);
            }
            if self.eat_symbol(';') {
                continue;
            }
            if self.peek().is_none() {
                return self.error(format!("Unterminated enum '{}'", def.name));
            }
            if self.is_keyword("option") {
                self.pos += 1;
                let option = self.full_ident_or_paren()?;
                self.expect_symbol('=')?;
                let value = self.next()?;
                if option == "allow_alias" && value == Token::Ident("true".to_string()) {
                    def.allow_alias = true;
                }
                self.skip_statement_tail()?;
                continue;
            }
            if self.is_keyword("reserved") {
                self.pos += 1;
                self.reserved(&mut def.reserved)?;
                continue;
            }
            let value_line = self.line();
            let value_name = self.ident()?;
            self.expect_symbol('=')?;
            let number = self.integer()?;
            self.field_options()?;
            self.expect_symbol(';')?;
            def.values.push(EnumValue {
                name: value_name,
                number,
                line: value_line,
            });
        }
    }

    fn full_ident_or_paren(&mut self) -> ParseResult<String> {
        if self.is_symbol('(') {
            self.skip_balanced()?;
            let mut rest = String::from("(custom)");
            while self.eat_symbol('.') {
                rest.push('.');
                rest.push_str(&self.ident()?);
            }
            Ok(rest)
        } else {
            self.full_ident()
        }
    }

    /// Remainder of a statement whose value may have been partially consumed
    fn skip_statement_tail(&mut self) -> ParseResult<()> {
        if self.tokens.get(self.pos.wrapping_sub(1)).map(|t| &t.token) == Some(&Token::Symbol('{')) {
            self.pos -= 1;
        }
        self.skip_statement()
    }

    fn service(&mut self) -> ParseResult<ServiceDef> {
        let name = self.ident()?;
        self.expect_symbol('{')?;
        let mut service = ServiceDef { name, rpcs: Vec::new() };
        loop {
            self.budget.check()?;
            if self.eat_symbol('}') {
                return Ok(service);
            }
            if self.eat_symbol(';') {
                continue;
            }
            let keyword = self.ident()?;
            match keyword.as_str() {
                "option" => self.skip_statement()?,
                "rpc" => {
                    let line = self.line();
                    let rpc_name = self.ident()?;
                    self.expect_symbol('(')?;
                    let client_streaming = self.is_keyword("stream") && self.peek_at(1) != Some(&Token::Symbol(')'));
                    if client_streaming {
                        self.pos += 1;
                    }
                    let input = self.full_ident()?;
                    self.expect_symbol(')')?;
                    if self.ident()? != "returns" {
                        self.pos -= 1;
                        return self.error("Expected 'returns'");
                    }
                    self.expect_symbol('(')?;
                    let server_streaming = self.is_keyword("stream") && self.peek_at(1) != Some(&Token::Symbol(')'));
                    if server_streaming {
                        self.pos += 1;
                    }
                    let output = self.full_ident()?;
                    self.expect_symbol(')')?;
                    if self.is_symbol('{') {
                        self.skip_balanced()?;
                    } else {
                        self.expect_symbol(';')?;
                    }
                    service.rpcs.push(RpcDef {
                        name: rpc_name,
                        input,
                        output,
                        client_streaming,
                        server_streaming,
                        line,
                    });
                }
                other => return self.error(format!("Unexpected '{}' in service '{}'", other, service.name)),
            }
        }
    }
}
