//! Lexer and recursive-descent parser.
//!
//! Produces a [`ModuleAst`] staging unit: the statement tree plus the
//! function and struct declarations hoisted out of it. Identifiers are left
//! unresolved; `prepare` assigns symbols afterwards.

use std::rc::Rc;

use crate::{
    ast::{
        BinaryOp, CastType, CatchClause, Expr, ExprLoc, FieldDecl, FieldKind, FormatPart, FuncDef,
        FuncId, Ident, ModuleId, NativeType, OverloadDecl, OverloadOp, Param, PrefixOp, Stmt,
        StmtLoc, StructDecl, StructDeclId, SuffixOp, SwitchCase,
    },
    error::Exception,
    intern::Interns,
};

/// Maximum expression nesting depth; guards the parser's own stack.
const MAX_NESTING_DEPTH: u32 = 200;

/// Parse output for one source file, with function/struct ids already offset
/// into the program-wide tables.
pub(crate) struct ModuleAst {
    pub file: String,
    pub source: String,
    pub module: ModuleId,
    pub body: Vec<StmtLoc>,
    pub funcs: Vec<FuncDef>,
    pub structs: Vec<StructDecl>,
    pub base_func: u32,
    pub base_struct: u32,
}

pub(crate) fn parse_module(
    source: String,
    file: String,
    module: ModuleId,
    base_func: u32,
    base_struct: u32,
    interns: &mut Interns,
) -> Result<ModuleAst, Exception> {
    let mut funcs = Vec::new();
    let mut structs = Vec::new();
    let body = {
        let mut ctx = Ctx {
            source: &source,
            interns,
            funcs: &mut funcs,
            structs: &mut structs,
            module,
            base_func,
            base_struct,
            depth: 0,
        };
        let mut lex = Lexer::new(&source, 0, source.len())
            .map_err(|e| Exception::parse_error(e.msg, &file, &source, e.pos))?;
        parse_body(&mut ctx, &mut lex)
            .map_err(|e| Exception::parse_error(e.msg, &file, &source, e.pos))?
    };
    Ok(ModuleAst {
        file,
        source,
        module,
        body,
        funcs,
        structs,
        base_func,
        base_struct,
    })
}

struct PErr {
    msg: String,
    pos: u32,
}

type PResult<T> = Result<T, PErr>;

fn err<T>(pos: u32, msg: impl Into<String>) -> PResult<T> {
    Err(PErr {
        msg: msg.into(),
        pos,
    })
}

struct Ctx<'a> {
    source: &'a str,
    interns: &'a mut Interns,
    funcs: &'a mut Vec<FuncDef>,
    structs: &'a mut Vec<StructDecl>,
    module: ModuleId,
    base_func: u32,
    base_struct: u32,
    depth: u32,
}

impl Ctx<'_> {
    fn add_func(&mut self, def: FuncDef) -> FuncId {
        let id = FuncId(self.base_func + u32::try_from(self.funcs.len()).expect("func overflow"));
        self.funcs.push(def);
        id
    }

    fn add_struct(&mut self, decl: StructDecl) -> StructDeclId {
        let id = StructDeclId(
            self.base_struct + u32::try_from(self.structs.len()).expect("struct overflow"),
        );
        self.structs.push(decl);
        id
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(Vec<RawPart>),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Dot,
    DotDot,
    Colon,
    Question,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Not,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Inc,
    Dec,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,

    KwVar,
    KwFunction,
    KwStruct,
    KwIf,
    KwElse,
    KwWhile,
    KwDo,
    KwFor,
    KwIn,
    KwSwitch,
    KwCase,
    KwDefault,
    KwTry,
    KwCatch,
    KwFinally,
    KwThrow,
    KwReturn,
    KwBreak,
    KwContinue,
    KwDelete,
    KwImport,
    KwFrom,
    KwNew,
    KwNewStack,
    KwTypeof,
    KwSizeof,
    KwCast,
    KwInstanceof,
    KwUndefined,
    KwStatic,
    KwPrivate,
    KwGet,
    KwSet,
    KwOperator,
    KwConstructor,
    KwDestructor,

    Eof,
}

/// A string-literal piece as the lexer sees it; `$` insertions keep their
/// source range and are re-parsed as expressions.
#[derive(Debug, Clone, PartialEq)]
enum RawPart {
    Text(Vec<u8>),
    Insert { start: u32, end: u32 },
}

#[derive(Debug, Clone)]
struct Token {
    kind: Tok,
    pos: u32,
}

#[derive(Clone)]
struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    end: usize,
    cur: Token,
}

impl<'s> Lexer<'s> {
    fn new(source: &'s str, start: usize, end: usize) -> PResult<Self> {
        let mut lex = Self {
            src: source.as_bytes(),
            pos: start,
            end,
            cur: Token {
                kind: Tok::Eof,
                pos: u32::try_from(start).unwrap_or(0),
            },
        };
        lex.cur = lex.scan()?;
        Ok(lex)
    }

    fn pos(&self) -> u32 {
        self.cur.pos
    }

    /// Returns the current token and reads the next one.
    fn advance(&mut self) -> PResult<Token> {
        let next = self.scan()?;
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn eat(&mut self, kind: &Tok) -> PResult<bool> {
        if self.cur.kind == *kind {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: &Tok, what: &str) -> PResult<Token> {
        if self.cur.kind == *kind {
            self.advance()
        } else {
            err(self.cur.pos, format!("expected {what}"))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<(String, u32)> {
        let tok = self.advance()?;
        match tok.kind {
            Tok::Ident(name) => Ok((name, tok.pos)),
            _ => err(tok.pos, format!("expected {what}")),
        }
    }

    fn skip_space(&mut self) -> PResult<()> {
        while self.pos < self.end {
            match self.src[self.pos] {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'/' if self.src.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.end && self.src[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.src.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.end {
                            return err(
                                u32::try_from(start).unwrap_or(0),
                                "unterminated block comment",
                            );
                        }
                        if self.src[self.pos] == b'*' && self.src[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn scan(&mut self) -> PResult<Token> {
        self.skip_space()?;
        let pos = u32::try_from(self.pos).expect("source too large");
        if self.pos >= self.end {
            return Ok(Token {
                kind: Tok::Eof,
                pos,
            });
        }
        let b = self.src[self.pos];
        let kind = match b {
            b'0'..=b'9' => return self.scan_number(pos),
            b'"' => return self.scan_string(pos),
            b'\'' => return self.scan_char(pos),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => return Ok(self.scan_word(pos)),
            _ => {
                self.pos += 1;
                let two = self.src.get(self.pos).copied();
                match (b, two) {
                    (b'(', _) => Tok::LParen,
                    (b')', _) => Tok::RParen,
                    (b'{', _) => Tok::LBrace,
                    (b'}', _) => Tok::RBrace,
                    (b'[', _) => Tok::LBracket,
                    (b']', _) => Tok::RBracket,
                    (b';', _) => Tok::Semicolon,
                    (b',', _) => Tok::Comma,
                    (b':', _) => Tok::Colon,
                    (b'?', _) => Tok::Question,
                    (b'~', _) => Tok::Tilde,
                    (b'.', Some(b'.')) => {
                        self.pos += 1;
                        Tok::DotDot
                    }
                    (b'.', _) => Tok::Dot,
                    (b'+', Some(b'+')) => {
                        self.pos += 1;
                        Tok::Inc
                    }
                    (b'+', Some(b'=')) => {
                        self.pos += 1;
                        Tok::PlusAssign
                    }
                    (b'+', _) => Tok::Plus,
                    (b'-', Some(b'-')) => {
                        self.pos += 1;
                        Tok::Dec
                    }
                    (b'-', Some(b'=')) => {
                        self.pos += 1;
                        Tok::MinusAssign
                    }
                    (b'-', _) => Tok::Minus,
                    (b'*', Some(b'=')) => {
                        self.pos += 1;
                        Tok::StarAssign
                    }
                    (b'*', _) => Tok::Star,
                    (b'/', Some(b'=')) => {
                        self.pos += 1;
                        Tok::SlashAssign
                    }
                    (b'/', _) => Tok::Slash,
                    (b'%', Some(b'=')) => {
                        self.pos += 1;
                        Tok::PercentAssign
                    }
                    (b'%', _) => Tok::Percent,
                    (b'&', Some(b'&')) => {
                        self.pos += 1;
                        Tok::AndAnd
                    }
                    (b'&', Some(b'=')) => {
                        self.pos += 1;
                        Tok::AmpAssign
                    }
                    (b'&', _) => Tok::Amp,
                    (b'|', Some(b'|')) => {
                        self.pos += 1;
                        Tok::OrOr
                    }
                    (b'|', Some(b'=')) => {
                        self.pos += 1;
                        Tok::PipeAssign
                    }
                    (b'|', _) => Tok::Pipe,
                    (b'^', Some(b'=')) => {
                        self.pos += 1;
                        Tok::CaretAssign
                    }
                    (b'^', _) => Tok::Caret,
                    (b'=', Some(b'=')) => {
                        self.pos += 1;
                        Tok::EqEq
                    }
                    (b'=', _) => Tok::Assign,
                    (b'!', Some(b'=')) => {
                        self.pos += 1;
                        Tok::Ne
                    }
                    (b'!', _) => Tok::Not,
                    (b'<', Some(b'<')) => {
                        self.pos += 1;
                        if self.src.get(self.pos) == Some(&b'=') {
                            self.pos += 1;
                            Tok::ShlAssign
                        } else {
                            Tok::Shl
                        }
                    }
                    (b'<', Some(b'=')) => {
                        self.pos += 1;
                        Tok::Le
                    }
                    (b'<', _) => Tok::Lt,
                    (b'>', Some(b'>')) => {
                        self.pos += 1;
                        if self.src.get(self.pos) == Some(&b'=') {
                            self.pos += 1;
                            Tok::ShrAssign
                        } else {
                            Tok::Shr
                        }
                    }
                    (b'>', Some(b'=')) => {
                        self.pos += 1;
                        Tok::Ge
                    }
                    (b'>', _) => Tok::Gt,
                    _ => return err(pos, format!("unexpected character '{}'", b as char)),
                }
            }
        };
        Ok(Token { kind, pos })
    }

    fn scan_word(&mut self, pos: u32) -> Token {
        let start = self.pos;
        while self.pos < self.end
            && matches!(self.src[self.pos], b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.src[start..self.pos]).expect("ascii word");
        let kind = match word {
            "var" => Tok::KwVar,
            "function" => Tok::KwFunction,
            "struct" => Tok::KwStruct,
            "if" => Tok::KwIf,
            "else" => Tok::KwElse,
            "while" => Tok::KwWhile,
            "do" => Tok::KwDo,
            "for" => Tok::KwFor,
            "in" => Tok::KwIn,
            "switch" => Tok::KwSwitch,
            "case" => Tok::KwCase,
            "default" => Tok::KwDefault,
            "try" => Tok::KwTry,
            "catch" => Tok::KwCatch,
            "finally" => Tok::KwFinally,
            "throw" => Tok::KwThrow,
            "return" => Tok::KwReturn,
            "break" => Tok::KwBreak,
            "continue" => Tok::KwContinue,
            "delete" => Tok::KwDelete,
            "import" => Tok::KwImport,
            "from" => Tok::KwFrom,
            "new" => Tok::KwNew,
            "new_stack" => Tok::KwNewStack,
            "typeof" => Tok::KwTypeof,
            "sizeof" => Tok::KwSizeof,
            "cast" => Tok::KwCast,
            "instanceof" => Tok::KwInstanceof,
            "undefined" => Tok::KwUndefined,
            "static" => Tok::KwStatic,
            "private" => Tok::KwPrivate,
            "get" => Tok::KwGet,
            "set" => Tok::KwSet,
            "operator" => Tok::KwOperator,
            "constructor" => Tok::KwConstructor,
            "destructor" => Tok::KwDestructor,
            _ => Tok::Ident(word.to_owned()),
        };
        Token { kind, pos }
    }

    fn scan_number(&mut self, pos: u32) -> PResult<Token> {
        let start = self.pos;
        if self.src[self.pos] == b'0' && self.src.get(self.pos + 1) == Some(&b'x') {
            self.pos += 2;
            let hex_start = self.pos;
            while self.pos < self.end && self.src[self.pos].is_ascii_hexdigit() {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[hex_start..self.pos]).expect("hex digits");
            let value = i64::from_str_radix(text, 16)
                .map_err(|_| PErr {
                    msg: "invalid hex literal".to_owned(),
                    pos,
                })?;
            return Ok(Token {
                kind: Tok::Int(value),
                pos,
            });
        }
        let mut is_float = false;
        while self.pos < self.end && self.src[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        // a '.' starts a fraction only when not the '..' range token
        if self.pos < self.end
            && self.src[self.pos] == b'.'
            && self.src.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            is_float = true;
            self.pos += 1;
            while self.pos < self.end && self.src[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.pos < self.end && matches!(self.src[self.pos], b'e' | b'E') {
            let mut ahead = self.pos + 1;
            if matches!(self.src.get(ahead), Some(b'+' | b'-')) {
                ahead += 1;
            }
            if self.src.get(ahead).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                self.pos = ahead;
                while self.pos < self.end && self.src[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("number digits");
        let kind = if is_float {
            Tok::Float(text.parse().map_err(|_| PErr {
                msg: "invalid float literal".to_owned(),
                pos,
            })?)
        } else {
            Tok::Int(text.parse().map_err(|_| PErr {
                msg: "integer literal out of range".to_owned(),
                pos,
            })?)
        };
        Ok(Token { kind, pos })
    }

    fn scan_escape(&mut self, pos: u32) -> PResult<u8> {
        let b = *self.src.get(self.pos).ok_or(PErr {
            msg: "unterminated escape".to_owned(),
            pos,
        })?;
        self.pos += 1;
        Ok(match b {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'$' => b'$',
            b'x' => {
                let hi = self.src.get(self.pos).copied();
                let lo = self.src.get(self.pos + 1).copied();
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return err(pos, "truncated \\x escape");
                };
                let digits = [hi, lo];
                let text = std::str::from_utf8(&digits).expect("hex escape");
                let value = u8::from_str_radix(text, 16)
                    .map_err(|_| PErr {
                        msg: "invalid \\x escape".to_owned(),
                        pos,
                    })?;
                self.pos += 2;
                value
            }
            other => return err(pos, format!("unknown escape '\\{}'", other as char)),
        })
    }

    fn scan_char(&mut self, pos: u32) -> PResult<Token> {
        self.pos += 1;
        let b = *self.src.get(self.pos).ok_or(PErr {
            msg: "unterminated character literal".to_owned(),
            pos,
        })?;
        self.pos += 1;
        let value = if b == b'\\' {
            self.scan_escape(pos)?
        } else {
            b
        };
        if self.src.get(self.pos) != Some(&b'\'') {
            return err(pos, "unterminated character literal");
        }
        self.pos += 1;
        Ok(Token {
            kind: Tok::Int(i64::from(value)),
            pos,
        })
    }

    fn scan_string(&mut self, pos: u32) -> PResult<Token> {
        self.pos += 1;
        let mut parts = Vec::new();
        let mut text = Vec::new();
        loop {
            let b = *self.src.get(self.pos).ok_or(PErr {
                msg: "unterminated string literal".to_owned(),
                pos,
            })?;
            match b {
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    let value = self.scan_escape(pos)?;
                    text.push(value);
                }
                b'$' => {
                    if !text.is_empty() {
                        parts.push(RawPart::Text(std::mem::take(&mut text)));
                    }
                    self.pos += 1;
                    let (start, end) = self.scan_insert(pos)?;
                    parts.push(RawPart::Insert {
                        start: u32::try_from(start).expect("source too large"),
                        end: u32::try_from(end).expect("source too large"),
                    });
                }
                _ => {
                    self.pos += 1;
                    text.push(b);
                }
            }
        }
        if parts.is_empty() || !text.is_empty() {
            parts.push(RawPart::Text(text));
        }
        Ok(Token {
            kind: Tok::Str(parts),
            pos,
        })
    }

    /// Records the source range of a `$ident` or `${expr}` insertion.
    fn scan_insert(&mut self, pos: u32) -> PResult<(usize, usize)> {
        if self.src.get(self.pos) == Some(&b'{') {
            self.pos += 1;
            let start = self.pos;
            let mut nesting = 1u32;
            loop {
                let b = *self.src.get(self.pos).ok_or(PErr {
                    msg: "unterminated ${} insertion".to_owned(),
                    pos,
                })?;
                match b {
                    b'{' => nesting += 1,
                    b'}' => {
                        nesting -= 1;
                        if nesting == 0 {
                            let end = self.pos;
                            self.pos += 1;
                            return Ok((start, end));
                        }
                    }
                    _ => {}
                }
                self.pos += 1;
            }
        }
        let start = self.pos;
        while self.pos < self.end
            && matches!(self.src[self.pos], b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return err(pos, "expected identifier after '$'");
        }
        Ok((start, self.pos))
    }
}

// ---------------------------------------------------------------------------
// Statements

fn parse_body(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<Vec<StmtLoc>> {
    let mut body = Vec::new();
    while lex.cur.kind != Tok::Eof {
        body.push(parse_stmt(ctx, lex)?);
    }
    Ok(body)
}

fn parse_block(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::LBrace, "'{'")?;
    let mut body = Vec::new();
    while !lex.eat(&Tok::RBrace)? {
        if lex.cur.kind == Tok::Eof {
            return err(pos, "unterminated block");
        }
        body.push(parse_stmt(ctx, lex)?);
    }
    Ok(StmtLoc {
        pos,
        stmt: Stmt::Block(body),
    })
}

fn parse_stmt(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    match &lex.cur.kind {
        Tok::LBrace => parse_block(ctx, lex),
        Tok::Semicolon => {
            lex.advance()?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Block(Vec::new()),
            })
        }
        Tok::KwVar => parse_var(ctx, lex),
        Tok::KwFunction => {
            lex.advance()?;
            let (name, _) = lex.expect_ident("function name")?;
            let id = parse_func_rest(ctx, lex, name.clone())?;
            let ident = Ident::new(ctx.interns.intern(&name));
            Ok(StmtLoc {
                pos,
                stmt: Stmt::FuncDef { id, ident },
            })
        }
        Tok::KwStruct => parse_struct(ctx, lex),
        Tok::KwIf => {
            lex.advance()?;
            lex.expect(&Tok::LParen, "'(' after if")?;
            let cond = parse_expr(ctx, lex)?;
            lex.expect(&Tok::RParen, "')'")?;
            let then = Box::new(parse_stmt(ctx, lex)?);
            let other = if lex.eat(&Tok::KwElse)? {
                Some(Box::new(parse_stmt(ctx, lex)?))
            } else {
                None
            };
            Ok(StmtLoc {
                pos,
                stmt: Stmt::If { cond, then, other },
            })
        }
        Tok::KwWhile => {
            lex.advance()?;
            lex.expect(&Tok::LParen, "'(' after while")?;
            let cond = parse_expr(ctx, lex)?;
            lex.expect(&Tok::RParen, "')'")?;
            let body = Box::new(parse_stmt(ctx, lex)?);
            Ok(StmtLoc {
                pos,
                stmt: Stmt::While { cond, body },
            })
        }
        Tok::KwDo => {
            lex.advance()?;
            let body = Box::new(parse_stmt(ctx, lex)?);
            lex.expect(&Tok::KwWhile, "'while' after do body")?;
            lex.expect(&Tok::LParen, "'('")?;
            let cond = parse_expr(ctx, lex)?;
            lex.expect(&Tok::RParen, "')'")?;
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::DoWhile { body, cond },
            })
        }
        Tok::KwFor => parse_for(ctx, lex),
        Tok::KwSwitch => parse_switch(ctx, lex),
        Tok::KwTry => parse_try(ctx, lex),
        Tok::KwThrow => {
            lex.advance()?;
            let value = parse_expr(ctx, lex)?;
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Throw(value),
            })
        }
        Tok::KwReturn => {
            lex.advance()?;
            let value = if lex.cur.kind == Tok::Semicolon {
                None
            } else {
                Some(parse_expr(ctx, lex)?)
            };
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Return(value),
            })
        }
        Tok::KwBreak => {
            lex.advance()?;
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Break,
            })
        }
        Tok::KwContinue => {
            lex.advance()?;
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Continue,
            })
        }
        Tok::KwDelete => {
            lex.advance()?;
            let value = parse_expr(ctx, lex)?;
            lex.expect(&Tok::Semicolon, "';'")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Delete(value),
            })
        }
        Tok::KwImport => parse_import(ctx, lex),
        _ => {
            let expr = parse_expr(ctx, lex)?;
            lex.expect(&Tok::Semicolon, "';' after expression")?;
            Ok(StmtLoc {
                pos,
                stmt: Stmt::Expr(expr),
            })
        }
    }
}

fn parse_var(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwVar, "'var'")?;
    let (name, _) = lex.expect_ident("variable name")?;
    let ident = Ident::new(ctx.interns.intern(&name));

    let array = match lex.cur.kind {
        Tok::LBracket => Some(false),
        Tok::LBrace => Some(true),
        _ => None,
    };
    if let Some(var_array) = array {
        lex.advance()?;
        let closer = if var_array { Tok::RBrace } else { Tok::RBracket };
        let size = if lex.cur.kind == closer {
            None
        } else {
            Some(parse_expr(ctx, lex)?)
        };
        lex.expect(&closer, "array size delimiter")?;
        let init = if lex.eat(&Tok::Assign)? {
            lex.expect(&Tok::LBracket, "'[' to start the initializer")?;
            let mut items = Vec::new();
            if !lex.eat(&Tok::RBracket)? {
                loop {
                    items.push(parse_expr(ctx, lex)?);
                    if !lex.eat(&Tok::Comma)? {
                        break;
                    }
                }
                lex.expect(&Tok::RBracket, "']'")?;
            }
            Some(items)
        } else {
            None
        };
        lex.expect(&Tok::Semicolon, "';'")?;
        return Ok(StmtLoc {
            pos,
            stmt: Stmt::ArrayDef {
                ident,
                size,
                init,
                var_array,
            },
        });
    }

    let init = if lex.eat(&Tok::Assign)? {
        Some(parse_expr(ctx, lex)?)
    } else {
        None
    };
    lex.expect(&Tok::Semicolon, "';'")?;
    Ok(StmtLoc {
        pos,
        stmt: Stmt::VarDef { ident, init },
    })
}

fn parse_for(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwFor, "'for'")?;
    lex.expect(&Tok::LParen, "'(' after for")?;

    // try the for-in shape first; back off to the classic three-part form
    let saved = lex.clone();
    if let Some(vars) = try_forin_head(ctx, lex)? {
        let subject = parse_expr(ctx, lex)?;
        lex.expect(&Tok::RParen, "')'")?;
        let body = Box::new(parse_stmt(ctx, lex)?);
        return Ok(StmtLoc {
            pos,
            stmt: Stmt::ForIn {
                vars,
                subject,
                body,
                frame_slots: 0,
            },
        });
    }
    *lex = saved;

    let init = Box::new(parse_stmt(ctx, lex)?);
    let cond = if lex.cur.kind == Tok::Semicolon {
        ExprLoc {
            pos: lex.pos(),
            expr: Expr::IntLit(1),
        }
    } else {
        parse_expr(ctx, lex)?
    };
    lex.expect(&Tok::Semicolon, "';' after loop condition")?;
    let step = if lex.cur.kind == Tok::RParen {
        ExprLoc {
            pos: lex.pos(),
            expr: Expr::IntLit(0),
        }
    } else {
        parse_expr(ctx, lex)?
    };
    lex.expect(&Tok::RParen, "')'")?;
    let body = Box::new(parse_stmt(ctx, lex)?);
    Ok(StmtLoc {
        pos,
        stmt: Stmt::For {
            init,
            cond,
            step,
            body,
        },
    })
}

fn try_forin_head(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<Option<Vec<Ident>>> {
    let _ = lex.eat(&Tok::KwVar)?;
    let Tok::Ident(first) = lex.cur.kind.clone() else {
        return Ok(None);
    };
    lex.advance()?;
    let mut vars = vec![Ident::new(ctx.interns.intern(&first))];
    if lex.eat(&Tok::Comma)? {
        let Tok::Ident(second) = lex.cur.kind.clone() else {
            return Ok(None);
        };
        lex.advance()?;
        vars.push(Ident::new(ctx.interns.intern(&second)));
    }
    if lex.eat(&Tok::KwIn)? {
        Ok(Some(vars))
    } else {
        Ok(None)
    }
}

fn parse_switch(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwSwitch, "'switch'")?;
    lex.expect(&Tok::LParen, "'('")?;
    let subject = parse_expr(ctx, lex)?;
    lex.expect(&Tok::RParen, "')'")?;
    lex.expect(&Tok::LBrace, "'{'")?;

    let mut cases = Vec::new();
    let mut default = None;
    while !lex.eat(&Tok::RBrace)? {
        if lex.eat(&Tok::KwCase)? {
            let lo = parse_case_value(lex)?;
            let hi = if lex.eat(&Tok::DotDot)? {
                parse_case_value(lex)?
            } else {
                lo
            };
            lex.expect(&Tok::Colon, "':' after case label")?;
            let body = parse_case_body(ctx, lex)?;
            cases.push(SwitchCase { lo, hi, body });
        } else if lex.eat(&Tok::KwDefault)? {
            lex.expect(&Tok::Colon, "':' after default")?;
            default = Some(parse_case_body(ctx, lex)?);
        } else {
            return err(lex.pos(), "expected 'case' or 'default'");
        }
    }
    Ok(StmtLoc {
        pos,
        stmt: Stmt::Switch {
            subject,
            cases,
            default,
        },
    })
}

fn parse_case_value(lex: &mut Lexer<'_>) -> PResult<i64> {
    let neg = lex.eat(&Tok::Minus)?;
    let tok = lex.advance()?;
    match tok.kind {
        Tok::Int(v) => Ok(if neg { -v } else { v }),
        _ => err(tok.pos, "case labels must be integer literals"),
    }
}

fn parse_case_body(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<Vec<StmtLoc>> {
    let mut body = Vec::new();
    while !matches!(
        lex.cur.kind,
        Tok::KwCase | Tok::KwDefault | Tok::RBrace | Tok::Eof
    ) {
        body.push(parse_stmt(ctx, lex)?);
    }
    Ok(body)
}

fn parse_try(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwTry, "'try'")?;
    let body = Box::new(parse_block(ctx, lex)?);
    let catch = if lex.eat(&Tok::KwCatch)? {
        let mut params = Vec::new();
        if lex.eat(&Tok::LParen)? && !lex.eat(&Tok::RParen)? {
            loop {
                let (name, _) = lex.expect_ident("catch parameter")?;
                params.push(Ident::new(ctx.interns.intern(&name)));
                if !lex.eat(&Tok::Comma)? {
                    break;
                }
            }
            lex.expect(&Tok::RParen, "')'")?;
        }
        Some(CatchClause {
            params,
            body: Box::new(parse_block(ctx, lex)?),
            frame_slots: 0,
        })
    } else {
        None
    };
    let finally = if lex.eat(&Tok::KwFinally)? {
        Some(Box::new(parse_block(ctx, lex)?))
    } else {
        None
    };
    if catch.is_none() && finally.is_none() {
        return err(pos, "try needs a catch or finally clause");
    }
    Ok(StmtLoc {
        pos,
        stmt: Stmt::Try {
            body,
            catch,
            finally,
        },
    })
}

fn parse_import(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwImport, "'import'")?;
    let mut names = Vec::new();
    loop {
        let (name, _) = lex.expect_ident("import symbol")?;
        let id = ctx.interns.intern(&name);
        names.push((id, Ident::new(id)));
        if !lex.eat(&Tok::Comma)? {
            break;
        }
    }
    let from = if lex.eat(&Tok::KwFrom)? {
        Some(parse_expr(ctx, lex)?)
    } else {
        None
    };
    lex.expect(&Tok::Semicolon, "';'")?;
    Ok(StmtLoc {
        pos,
        stmt: Stmt::Import { names, from },
    })
}

// ---------------------------------------------------------------------------
// Functions and structs

fn parse_params(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<Vec<Param>> {
    lex.expect(&Tok::LParen, "'('")?;
    let mut params = Vec::new();
    if lex.eat(&Tok::RParen)? {
        return Ok(params);
    }
    loop {
        let (name, _) = lex.expect_ident("parameter name")?;
        let default = if lex.eat(&Tok::Assign)? {
            Some(parse_expr(ctx, lex)?)
        } else {
            None
        };
        params.push(Param {
            name: ctx.interns.intern(&name),
            default,
            slot: 0,
        });
        if !lex.eat(&Tok::Comma)? {
            break;
        }
    }
    lex.expect(&Tok::RParen, "')'")?;
    Ok(params)
}

/// Parses `(params) { body }` and registers the function.
fn parse_func_rest(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>, name: String) -> PResult<FuncId> {
    let params = parse_params(ctx, lex)?;
    let body = parse_block(ctx, lex)?;
    let body = match body.stmt {
        Stmt::Block(stmts) => stmts,
        _ => unreachable!("parse_block returns a block"),
    };
    Ok(ctx.add_func(FuncDef {
        name,
        module: ctx.module,
        params,
        body,
        frame_slots: 0,
        this_slot: 0,
        args_slot: 0,
    }))
}

fn parse_struct(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<StmtLoc> {
    let pos = lex.pos();
    lex.expect(&Tok::KwStruct, "'struct'")?;
    let (name, _) = lex.expect_ident("struct name")?;
    lex.expect(&Tok::LBrace, "'{'")?;

    let mut fields = Vec::new();
    let mut overloads = Vec::new();
    while !lex.eat(&Tok::RBrace)? {
        parse_struct_member(ctx, lex, &name, &mut fields, &mut overloads)?;
    }
    let _ = lex.eat(&Tok::Semicolon)?;

    let interned_name = ctx.interns.intern(&name);
    let id = ctx.add_struct(StructDecl {
        name: interned_name,
        module: ctx.module,
        fields,
        overloads,
    });
    let ident = Ident::new(ctx.interns.intern(&name));
    Ok(StmtLoc {
        pos,
        stmt: Stmt::StructDef { id, ident },
    })
}

fn parse_struct_member(
    ctx: &mut Ctx<'_>,
    lex: &mut Lexer<'_>,
    struct_name: &str,
    fields: &mut Vec<FieldDecl>,
    overloads: &mut Vec<OverloadDecl>,
) -> PResult<()> {
    let pos = lex.pos();
    let mut is_static = false;
    let mut private = false;
    loop {
        if lex.eat(&Tok::KwStatic)? {
            is_static = true;
        } else if lex.eat(&Tok::KwPrivate)? {
            private = true;
        } else {
            break;
        }
    }

    match lex.cur.kind.clone() {
        Tok::KwConstructor => {
            lex.advance()?;
            let func = parse_func_rest(ctx, lex, format!("{struct_name}.constructor"))?;
            overloads.push(OverloadDecl {
                op: OverloadOp::New,
                is_static,
                func,
            });
        }
        Tok::KwDestructor => {
            lex.advance()?;
            let func = parse_func_rest(ctx, lex, format!("{struct_name}.destructor"))?;
            overloads.push(OverloadDecl {
                op: OverloadOp::Delete,
                is_static,
                func,
            });
        }
        Tok::KwOperator => {
            lex.advance()?;
            let op = parse_overload_op(lex)?;
            let func = parse_func_rest(ctx, lex, format!("{struct_name}.operator"))?;
            overloads.push(OverloadDecl {
                op,
                is_static,
                func,
            });
        }
        Tok::KwGet => {
            lex.advance()?;
            let (name, _) = lex.expect_ident("getter name")?;
            if lex.cur.kind == Tok::LParen {
                lex.advance()?;
                lex.expect(&Tok::RParen, "')'")?;
            }
            let body = parse_block(ctx, lex)?;
            let body = match body.stmt {
                Stmt::Block(stmts) => stmts,
                _ => unreachable!(),
            };
            let func = ctx.add_func(FuncDef {
                name: format!("{struct_name}.get {name}"),
                module: ctx.module,
                params: Vec::new(),
                body,
                frame_slots: 0,
                this_slot: 0,
                args_slot: 0,
            });
            fields.push(FieldDecl {
                name: ctx.interns.intern(&name),
                kind: FieldKind::Getter(func),
                is_static,
                private,
                pos,
            });
        }
        Tok::KwSet => {
            lex.advance()?;
            let (name, _) = lex.expect_ident("setter name")?;
            let params = parse_params(ctx, lex)?;
            if params.len() != 1 {
                return err(pos, "setters take exactly one parameter");
            }
            let body = parse_block(ctx, lex)?;
            let body = match body.stmt {
                Stmt::Block(stmts) => stmts,
                _ => unreachable!(),
            };
            let func = ctx.add_func(FuncDef {
                name: format!("{struct_name}.set {name}"),
                module: ctx.module,
                params,
                body,
                frame_slots: 0,
                this_slot: 0,
                args_slot: 0,
            });
            fields.push(FieldDecl {
                name: ctx.interns.intern(&name),
                kind: FieldKind::Setter(func),
                is_static,
                private,
                pos,
            });
        }
        Tok::Ident(name) => {
            lex.advance()?;
            let name_id = ctx.interns.intern(&name);
            match lex.cur.kind {
                Tok::LParen => {
                    let func = parse_func_rest(ctx, lex, format!("{struct_name}.{name}"))?;
                    fields.push(FieldDecl {
                        name: name_id,
                        kind: FieldKind::Function(func),
                        is_static,
                        private,
                        pos,
                    });
                }
                Tok::Colon => {
                    lex.advance()?;
                    let (ty_name, ty_pos) = lex.expect_ident("native type name")?;
                    let ty = parse_native_type(&ty_name)
                        .ok_or(PErr {
                            msg: format!("unknown native type '{ty_name}'"),
                            pos: ty_pos,
                        })?;
                    lex.expect(&Tok::Semicolon, "';'")?;
                    fields.push(FieldDecl {
                        name: name_id,
                        kind: FieldKind::Typed(ty),
                        is_static,
                        private,
                        pos,
                    });
                }
                Tok::LBracket | Tok::LBrace => {
                    let var_array = lex.cur.kind == Tok::LBrace;
                    lex.advance()?;
                    let closer = if var_array { Tok::RBrace } else { Tok::RBracket };
                    let size = if lex.cur.kind == closer {
                        None
                    } else {
                        Some(parse_expr(ctx, lex)?)
                    };
                    lex.expect(&closer, "array size delimiter")?;
                    let init = if lex.eat(&Tok::Assign)? {
                        lex.expect(&Tok::LBracket, "'['")?;
                        let mut items = Vec::new();
                        if !lex.eat(&Tok::RBracket)? {
                            loop {
                                items.push(parse_expr(ctx, lex)?);
                                if !lex.eat(&Tok::Comma)? {
                                    break;
                                }
                            }
                            lex.expect(&Tok::RBracket, "']'")?;
                        }
                        Some(items)
                    } else {
                        None
                    };
                    lex.expect(&Tok::Semicolon, "';'")?;
                    let kind = if var_array {
                        FieldKind::VarArray { size, init }
                    } else {
                        FieldKind::Array { size, init }
                    };
                    fields.push(FieldDecl {
                        name: name_id,
                        kind,
                        is_static,
                        private,
                        pos,
                    });
                }
                _ => {
                    let init = if lex.eat(&Tok::Assign)? {
                        Some(parse_expr(ctx, lex)?)
                    } else {
                        None
                    };
                    lex.expect(&Tok::Semicolon, "';'")?;
                    fields.push(FieldDecl {
                        name: name_id,
                        kind: FieldKind::Var { init },
                        is_static,
                        private,
                        pos,
                    });
                }
            }
        }
        _ => return err(pos, "expected struct member"),
    }
    Ok(())
}

fn parse_overload_op(lex: &mut Lexer<'_>) -> PResult<OverloadOp> {
    let tok = lex.advance()?;
    Ok(match tok.kind {
        Tok::LBracket => {
            lex.expect(&Tok::RBracket, "']'")?;
            if lex.eat(&Tok::Assign)? {
                OverloadOp::IndexAssign
            } else {
                OverloadOp::Index
            }
        }
        Tok::LParen => {
            lex.expect(&Tok::RParen, "')'")?;
            OverloadOp::Call
        }
        Tok::Dot => {
            if lex.eat(&Tok::Assign)? {
                OverloadOp::MemberAssign
            } else if lex.eat(&Tok::LParen)? {
                lex.expect(&Tok::RParen, "')'")?;
                OverloadOp::MemberCall
            } else {
                OverloadOp::Member
            }
        }
        Tok::KwFor => {
            lex.expect(&Tok::KwIn, "'in' after 'operator for'")?;
            OverloadOp::ForIn
        }
        Tok::KwIn => OverloadOp::ForIn,
        Tok::KwNew => OverloadOp::New,
        Tok::KwDelete => OverloadOp::Delete,
        Tok::Inc => OverloadOp::Inc,
        Tok::Dec => OverloadOp::Dec,
        Tok::Plus => OverloadOp::Binary(BinaryOp::Add),
        Tok::Minus => OverloadOp::Binary(BinaryOp::Sub),
        Tok::Star => OverloadOp::Binary(BinaryOp::Mul),
        Tok::Slash => OverloadOp::Binary(BinaryOp::Div),
        Tok::Percent => OverloadOp::Binary(BinaryOp::Mod),
        Tok::Amp => OverloadOp::Binary(BinaryOp::And),
        Tok::Pipe => OverloadOp::Binary(BinaryOp::Or),
        Tok::Caret => OverloadOp::Binary(BinaryOp::Xor),
        Tok::Shl => OverloadOp::Binary(BinaryOp::Shl),
        Tok::Shr => OverloadOp::Binary(BinaryOp::Shr),
        Tok::EqEq => OverloadOp::Binary(BinaryOp::Equal),
        Tok::Ne => OverloadOp::Binary(BinaryOp::Inequal),
        Tok::Lt => OverloadOp::Binary(BinaryOp::Less),
        Tok::Le => OverloadOp::Binary(BinaryOp::LessEqual),
        Tok::Gt => OverloadOp::Binary(BinaryOp::Greater),
        Tok::Ge => OverloadOp::Binary(BinaryOp::GreaterEqual),
        Tok::PlusAssign => OverloadOp::BinaryAssign(BinaryOp::Add),
        Tok::MinusAssign => OverloadOp::BinaryAssign(BinaryOp::Sub),
        Tok::StarAssign => OverloadOp::BinaryAssign(BinaryOp::Mul),
        Tok::SlashAssign => OverloadOp::BinaryAssign(BinaryOp::Div),
        Tok::PercentAssign => OverloadOp::BinaryAssign(BinaryOp::Mod),
        Tok::AmpAssign => OverloadOp::BinaryAssign(BinaryOp::And),
        Tok::PipeAssign => OverloadOp::BinaryAssign(BinaryOp::Or),
        Tok::CaretAssign => OverloadOp::BinaryAssign(BinaryOp::Xor),
        Tok::ShlAssign => OverloadOp::BinaryAssign(BinaryOp::Shl),
        Tok::ShrAssign => OverloadOp::BinaryAssign(BinaryOp::Shr),
        _ => return err(tok.pos, "unknown overloadable operator"),
    })
}

fn parse_native_type(name: &str) -> Option<NativeType> {
    Some(match name {
        "i8" | "char" => NativeType::I8,
        "u8" | "uchar" => NativeType::U8,
        "i16" | "short" => NativeType::I16,
        "u16" | "ushort" => NativeType::U16,
        "i32" | "int" => NativeType::I32,
        "u32" | "uint" => NativeType::U32,
        "i64" | "long" => NativeType::I64,
        "u64" | "ulong" | "size_t" => NativeType::U64,
        "f32" | "single" => NativeType::F32,
        "f64" | "double" | "float" => NativeType::F64,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Expressions

fn parse_expr(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    ctx.depth += 1;
    if ctx.depth > MAX_NESTING_DEPTH {
        return err(lex.pos(), "expression nesting too deep");
    }
    let result = parse_assign(ctx, lex);
    ctx.depth -= 1;
    result
}

fn parse_assign(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let target = parse_ternary(ctx, lex)?;
    let pos = lex.pos();
    let op = match lex.cur.kind {
        Tok::Assign => None,
        Tok::PlusAssign => Some(BinaryOp::Add),
        Tok::MinusAssign => Some(BinaryOp::Sub),
        Tok::StarAssign => Some(BinaryOp::Mul),
        Tok::SlashAssign => Some(BinaryOp::Div),
        Tok::PercentAssign => Some(BinaryOp::Mod),
        Tok::AmpAssign => Some(BinaryOp::And),
        Tok::PipeAssign => Some(BinaryOp::Or),
        Tok::CaretAssign => Some(BinaryOp::Xor),
        Tok::ShlAssign => Some(BinaryOp::Shl),
        Tok::ShrAssign => Some(BinaryOp::Shr),
        _ => return Ok(target),
    };
    lex.advance()?;
    let value = Box::new(parse_assign(ctx, lex)?);
    let target = Box::new(target);
    Ok(ExprLoc {
        pos,
        expr: match op {
            None => Expr::Assign { target, value },
            Some(op) => Expr::OpAssign { op, target, value },
        },
    })
}

fn parse_ternary(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let cond = parse_logic_or(ctx, lex)?;
    if lex.cur.kind != Tok::Question {
        return Ok(cond);
    }
    let pos = lex.pos();
    lex.advance()?;
    let then = parse_expr(ctx, lex)?;
    lex.expect(&Tok::Colon, "':' in conditional expression")?;
    let other = parse_ternary(ctx, lex)?;
    Ok(ExprLoc {
        pos,
        expr: Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            other: Box::new(other),
        },
    })
}

macro_rules! binary_level {
    ($name:ident, $next:ident, $($tok:pat => $op:expr),+ $(,)?) => {
        fn $name(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
            let mut left = $next(ctx, lex)?;
            loop {
                let op = match lex.cur.kind {
                    $($tok => $op,)+
                    _ => return Ok(left),
                };
                let pos = lex.pos();
                lex.advance()?;
                let right = $next(ctx, lex)?;
                left = ExprLoc {
                    pos,
                    expr: Expr::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                };
            }
        }
    };
}

fn parse_logic_or(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let mut left = parse_logic_and(ctx, lex)?;
    while lex.cur.kind == Tok::OrOr {
        let pos = lex.pos();
        lex.advance()?;
        let right = parse_logic_and(ctx, lex)?;
        left = ExprLoc {
            pos,
            expr: Expr::Logic {
                and: false,
                left: Box::new(left),
                right: Box::new(right),
            },
        };
    }
    Ok(left)
}

fn parse_logic_and(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let mut left = parse_bit_or(ctx, lex)?;
    while lex.cur.kind == Tok::AndAnd {
        let pos = lex.pos();
        lex.advance()?;
        let right = parse_bit_or(ctx, lex)?;
        left = ExprLoc {
            pos,
            expr: Expr::Logic {
                and: true,
                left: Box::new(left),
                right: Box::new(right),
            },
        };
    }
    Ok(left)
}

binary_level!(parse_bit_or, parse_bit_xor, Tok::Pipe => BinaryOp::Or);
binary_level!(parse_bit_xor, parse_bit_and, Tok::Caret => BinaryOp::Xor);
binary_level!(parse_bit_and, parse_equality, Tok::Amp => BinaryOp::And);
binary_level!(parse_equality, parse_relational,
    Tok::EqEq => BinaryOp::Equal,
    Tok::Ne => BinaryOp::Inequal,
);

fn parse_relational(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let mut left = parse_shift(ctx, lex)?;
    loop {
        let pos = lex.pos();
        if lex.eat(&Tok::KwInstanceof)? {
            let right = parse_shift(ctx, lex)?;
            left = ExprLoc {
                pos,
                expr: Expr::Instanceof {
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
            continue;
        }
        let op = match lex.cur.kind {
            Tok::Lt => BinaryOp::Less,
            Tok::Le => BinaryOp::LessEqual,
            Tok::Gt => BinaryOp::Greater,
            Tok::Ge => BinaryOp::GreaterEqual,
            _ => return Ok(left),
        };
        lex.advance()?;
        let right = parse_shift(ctx, lex)?;
        left = ExprLoc {
            pos,
            expr: Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        };
    }
}

binary_level!(parse_shift, parse_additive,
    Tok::Shl => BinaryOp::Shl,
    Tok::Shr => BinaryOp::Shr,
);
binary_level!(parse_additive, parse_multiplicative,
    Tok::Plus => BinaryOp::Add,
    Tok::Minus => BinaryOp::Sub,
);
binary_level!(parse_multiplicative, parse_unary,
    Tok::Star => BinaryOp::Mul,
    Tok::Slash => BinaryOp::Div,
    Tok::Percent => BinaryOp::Mod,
);

fn parse_unary(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let pos = lex.pos();
    let op = match lex.cur.kind {
        Tok::Not => PrefixOp::LogicNot,
        Tok::Tilde => PrefixOp::BitNot,
        Tok::Plus => PrefixOp::Plus,
        Tok::Minus => PrefixOp::Minus,
        Tok::Inc => PrefixOp::Inc,
        Tok::Dec => PrefixOp::Dec,
        Tok::Amp => PrefixOp::Address,
        Tok::Star => PrefixOp::Deref,
        Tok::KwTypeof => PrefixOp::Typeof,
        Tok::KwSizeof => PrefixOp::Sizeof,
        Tok::KwCast => {
            lex.advance()?;
            lex.expect(&Tok::Lt, "'<' after cast")?;
            let (ty_name, ty_pos) = lex.expect_ident("cast target type")?;
            let ty = match ty_name.as_str() {
                "int" => CastType::Int,
                "float" => CastType::Float,
                "native" => CastType::Native,
                "pointer" => CastType::Pointer,
                _ => return err(ty_pos, format!("cannot cast to '{ty_name}'")),
            };
            lex.expect(&Tok::Gt, "'>'")?;
            let value = parse_unary(ctx, lex)?;
            return Ok(ExprLoc {
                pos,
                expr: Expr::Cast {
                    ty,
                    value: Box::new(value),
                },
            });
        }
        _ => return parse_postfix(ctx, lex),
    };
    lex.advance()?;
    let operand = parse_unary(ctx, lex)?;
    Ok(ExprLoc {
        pos,
        expr: Expr::Prefix {
            op,
            operand: Box::new(operand),
        },
    })
}

fn parse_args(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<Vec<ExprLoc>> {
    lex.expect(&Tok::LParen, "'('")?;
    let mut args = Vec::new();
    if lex.eat(&Tok::RParen)? {
        return Ok(args);
    }
    loop {
        args.push(parse_expr(ctx, lex)?);
        if !lex.eat(&Tok::Comma)? {
            break;
        }
    }
    lex.expect(&Tok::RParen, "')'")?;
    Ok(args)
}

fn parse_postfix(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let mut value = parse_primary(ctx, lex)?;
    loop {
        let pos = lex.pos();
        match lex.cur.kind {
            Tok::LParen => {
                let args = parse_args(ctx, lex)?;
                value = ExprLoc {
                    pos,
                    expr: Expr::Call {
                        target: Box::new(value),
                        args,
                    },
                };
            }
            Tok::LBracket => {
                lex.advance()?;
                let start = if lex.cur.kind == Tok::Colon {
                    None
                } else {
                    Some(parse_expr(ctx, lex)?)
                };
                if lex.eat(&Tok::Colon)? {
                    let end = if lex.cur.kind == Tok::RBracket {
                        None
                    } else {
                        Some(parse_expr(ctx, lex)?)
                    };
                    lex.expect(&Tok::RBracket, "']'")?;
                    value = ExprLoc {
                        pos,
                        expr: Expr::Slice {
                            base: Box::new(value),
                            start: start.map(Box::new),
                            end: end.map(Box::new),
                        },
                    };
                } else {
                    lex.expect(&Tok::RBracket, "']'")?;
                    let index = start.ok_or(PErr {
                        msg: "expected index expression".to_owned(),
                        pos,
                    })?;
                    value = ExprLoc {
                        pos,
                        expr: Expr::Index {
                            base: Box::new(value),
                            index: Box::new(index),
                        },
                    };
                }
            }
            Tok::Dot => {
                lex.advance()?;
                let (name, _) = lex.expect_ident("member name")?;
                value = ExprLoc {
                    pos,
                    expr: Expr::Member {
                        base: Box::new(value),
                        name: ctx.interns.intern(&name),
                    },
                };
            }
            Tok::Inc => {
                lex.advance()?;
                value = ExprLoc {
                    pos,
                    expr: Expr::Suffix {
                        op: SuffixOp::Inc,
                        operand: Box::new(value),
                    },
                };
            }
            Tok::Dec => {
                lex.advance()?;
                value = ExprLoc {
                    pos,
                    expr: Expr::Suffix {
                        op: SuffixOp::Dec,
                        operand: Box::new(value),
                    },
                };
            }
            _ => return Ok(value),
        }
    }
}

fn parse_primary(ctx: &mut Ctx<'_>, lex: &mut Lexer<'_>) -> PResult<ExprLoc> {
    let tok = lex.advance()?;
    let pos = tok.pos;
    let expr = match tok.kind {
        Tok::Int(v) => Expr::IntLit(v),
        Tok::Float(v) => Expr::FloatLit(v),
        Tok::KwUndefined => Expr::Undefined,
        Tok::Str(parts) => parse_string_parts(ctx, parts)?,
        Tok::Ident(name) => Expr::Ident(Ident::new(ctx.interns.intern(&name))),
        Tok::LParen => {
            let inner = parse_expr(ctx, lex)?;
            lex.expect(&Tok::RParen, "')'")?;
            inner.expr
        }
        Tok::LBracket => {
            let mut items = Vec::new();
            if !lex.eat(&Tok::RBracket)? {
                loop {
                    items.push(parse_expr(ctx, lex)?);
                    if !lex.eat(&Tok::Comma)? {
                        break;
                    }
                }
                lex.expect(&Tok::RBracket, "']'")?;
            }
            Expr::ArrayLit(items)
        }
        Tok::KwFunction => {
            let id = parse_func_rest(ctx, lex, "(anonymous)".to_owned())?;
            Expr::FuncLit(id)
        }
        Tok::KwNew | Tok::KwNewStack => {
            let on_stack = tok.kind == Tok::KwNewStack;
            let (name, name_pos) = lex.expect_ident("struct name after new")?;
            let mut target = ExprLoc {
                pos: name_pos,
                expr: Expr::Ident(Ident::new(ctx.interns.intern(&name))),
            };
            while lex.eat(&Tok::Dot)? {
                let (member, member_pos) = lex.expect_ident("member name")?;
                target = ExprLoc {
                    pos: member_pos,
                    expr: Expr::Member {
                        base: Box::new(target),
                        name: ctx.interns.intern(&member),
                    },
                };
            }
            let args = parse_args(ctx, lex)?;
            Expr::New {
                target: Box::new(target),
                args,
                on_stack,
            }
        }
        other => {
            return err(pos, format!("unexpected token {other:?} in expression"));
        }
    };
    Ok(ExprLoc { pos, expr })
}

/// Turns the lexer's raw string pieces into an AST literal; insertions are
/// re-parsed from their recorded source range.
fn parse_string_parts(ctx: &mut Ctx<'_>, parts: Vec<RawPart>) -> PResult<Expr> {
    if parts.len() == 1
        && let RawPart::Text(text) = &parts[0]
    {
        let mut bytes = text.clone();
        bytes.push(0);
        return Ok(Expr::StrLit(Rc::from(bytes.into_boxed_slice())));
    }
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            RawPart::Text(text) => out.push(FormatPart::Text(text)),
            RawPart::Insert { start, end } => {
                let source: &str = ctx.source;
                let mut sub = Lexer::new(source, start as usize, end as usize)?;
                let expr = parse_expr(ctx, &mut sub)?;
                if sub.cur.kind != Tok::Eof {
                    return err(sub.pos(), "unexpected token in string insertion");
                }
                out.push(FormatPart::Insert(expr));
            }
        }
    }
    Ok(Expr::StrFormat(out))
}
