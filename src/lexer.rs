use std::{
    collections::HashMap,
    fs,
    io::{self, ErrorKind},
    path::Path,
};

use crate::diag::{Diag, DiagResult, Diagnostics};

/// Pushback region reserved in front of every buffer. Macro-argument and
/// string-equate expansion write into it backwards; running out means the
/// expansion is unreasonably deep and the run aborts.
pub const SAFETY_MARGIN: usize = 1024;

/// Longest string literal, matching the object-file field width.
pub const MAX_STR_LEN: usize = 255;

/// Floating token classes live in one bit of a `u32` mask each.
pub const MAX_FLOAT_CLASSES: usize = 32;

/// Token code returned when the context stack runs dry.
pub const EOF: u32 = 0x8000;
/// Token code for quoted strings and raw macro arguments.
pub const STRING: u32 = 0x8001;
/// Newlines come back as their own token so drivers can track statements.
pub const NEWLINE: u32 = b'\n' as u32;

fn err_at(file: &str, line: u32, msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, format!("{file}:{line}: {msg}"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Num(i32),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: u32,
    pub value: TokenValue,
}

impl Token {
    pub fn fixed(kind: u32) -> Self {
        Self {
            kind,
            value: TokenValue::None,
        }
    }

    pub fn text(&self) -> &str {
        match &self.value {
            TokenValue::Text(text) => text,
            _ => "",
        }
    }

    pub fn num(&self) -> i32 {
        match self.value {
            TokenValue::Num(num) => num,
            _ => 0,
        }
    }
}

/// In-memory source text with a pushback margin in front and a NUL sentinel
/// at the end. Creation normalizes line endings (`\r\n` becomes `" \n"` so
/// offsets keep their spacing), blanks `;` comments outside string literals,
/// and guarantees a trailing newline.
#[derive(Debug)]
pub struct SourceBuffer {
    data: Vec<u8>,
    cursor: usize,
    line: u32,
}

impl SourceBuffer {
    pub fn from_str(src: &str) -> Self {
        let bytes = src.as_bytes();
        let mut data = Vec::with_capacity(SAFETY_MARGIN + bytes.len() + 2);
        data.resize(SAFETY_MARGIN, 0);
        let mut in_string = false;
        let mut in_comment = false;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'\\' if in_string && (i + 1) < bytes.len() => {
                    data.push(c);
                    data.push(bytes[i + 1]);
                    i += 2;
                    continue;
                }
                b'\r' => {
                    if bytes.get(i + 1) == Some(&b'\n') {
                        data.push(b' ');
                    } else {
                        in_string = false;
                        in_comment = false;
                        data.push(b'\n');
                    }
                }
                b'\n' => {
                    in_string = false;
                    in_comment = false;
                    data.push(b'\n');
                }
                b'"' if !in_comment => {
                    in_string = !in_string;
                    data.push(c);
                }
                b';' if !in_string => {
                    in_comment = true;
                    data.push(b' ');
                }
                0 => data.push(b' '),
                _ => data.push(if in_comment { b' ' } else { c }),
            }
            i += 1;
        }
        if data.last() != Some(&b'\n') {
            data.push(b'\n');
        }
        data.push(0);
        Self {
            data,
            cursor: SAFETY_MARGIN,
            line: 1,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let src = fs::read_to_string(&path).map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("cant open file: {}: {e}", path.as_ref().display()),
            )
        })?;
        Ok(Self::from_str(&src))
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Byte under the cursor; 0 means end of buffer.
    pub fn peek(&self) -> u8 {
        self.data[self.cursor]
    }

    /// Byte `ofs` positions past the cursor, 0 past the end.
    pub fn at(&self, ofs: usize) -> u8 {
        match self.data.get(self.cursor + ofs) {
            Some(&b) => b,
            None => 0,
        }
    }

    pub fn advance(&mut self, n: usize) {
        for _ in 0..n {
            if self.data[self.cursor] == 0 {
                break;
            }
            if self.data[self.cursor] == b'\n' {
                self.line += 1;
            }
            self.cursor += 1;
        }
    }

    pub fn unget_char(&mut self, c: u8) -> DiagResult<()> {
        if self.cursor == 0 {
            return Err(Diag::fatal("pushback safety margin exceeded"));
        }
        self.cursor -= 1;
        self.data[self.cursor] = c;
        if c == b'\n' {
            self.line = self.line.saturating_sub(1);
        }
        Ok(())
    }

    pub fn unget_str(&mut self, s: &[u8]) -> DiagResult<()> {
        for &c in s.iter().rev() {
            self.unget_char(c)?;
        }
        Ok(())
    }

    pub fn at_end(&self) -> bool {
        self.peek() == 0
    }
}

/// Arguments carried by a macro-body (or repeat-body) context. `\1`..`\9`
/// pull from `args`, `\@` expands to a name unique to the invocation.
#[derive(Debug, Clone)]
pub struct MacroArgs {
    pub args: Vec<String>,
    pub unique: u32,
}

impl MacroArgs {
    pub fn get(&self, n: usize) -> Option<&str> {
        if n == 0 {
            return None;
        }
        self.args.get(n - 1).map(|s| s.as_str())
    }

    pub fn unique_name(&self) -> String {
        format!("_{}", self.unique)
    }
}

/// One entry of the lexer's context stack: a buffer plus where it came from.
#[derive(Debug)]
pub struct Context {
    pub buf: SourceBuffer,
    pub file: String,
    pub args: Option<MacroArgs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOutcome {
    /// Accept the match; the lexer advances the buffer by the matched length.
    Token(i32),
    /// The callback rewrote the buffer (macro-arg splice); scan again from
    /// the top without advancing.
    Rescan,
}

pub type FloatCallback = fn(&mut Context, usize) -> DiagResult<FloatOutcome>;

pub struct FloatSpec {
    pub first: fn(u8) -> bool,
    pub second: fn(u8) -> bool,
    pub rest: fn(u8) -> bool,
    pub token: u32,
    /// Promotion kind when the match starts a line (identifier → label).
    pub line_start_token: Option<u32>,
    pub callback: Option<FloatCallback>,
}

struct FloatClass {
    token: u32,
    line_start_token: Option<u32>,
    callback: Option<FloatCallback>,
}

/// Token tables built once by the driver before lexing begins: up to 32
/// floating classes in per-position bitmask tables, and a case-insensitive
/// fixed-token dictionary probed by incrementally longer uppercased
/// prefixes.
pub struct Rules {
    floats: Vec<FloatClass>,
    first: [u32; 256],
    second: [u32; 256],
    rest: [u32; 256],
    fixed: HashMap<String, u32>,
    max_fixed_len: usize,
}

impl Default for Rules {
    fn default() -> Self {
        Self::new()
    }
}

impl Rules {
    pub fn new() -> Self {
        Self {
            floats: Vec::new(),
            first: [0; 256],
            second: [0; 256],
            rest: [0; 256],
            fixed: HashMap::new(),
            max_fixed_len: 0,
        }
    }

    pub fn add_fixed(&mut self, text: &str, token: u32) {
        let key = text.to_ascii_uppercase();
        self.max_fixed_len = self.max_fixed_len.max(key.len());
        self.fixed.insert(key, token);
    }

    pub fn add_float(&mut self, spec: FloatSpec) -> DiagResult<()> {
        if self.floats.len() >= MAX_FLOAT_CLASSES {
            return Err(Diag::fatal("too many floating token classes"));
        }
        let bit = 1u32 << self.floats.len();
        for c in 0..256usize {
            let b = c as u8;
            if (spec.first)(b) {
                self.first[c] |= bit;
            }
            if (spec.second)(b) {
                self.second[c] |= bit;
            }
            if (spec.rest)(b) {
                self.rest[c] |= bit;
            }
        }
        self.floats.push(FloatClass {
            token: spec.token,
            line_start_token: spec.line_start_token,
            callback: spec.callback,
        });
        Ok(())
    }

    /// Longest floating match at the cursor, with the surviving class mask.
    fn float_match(&self, buf: &SourceBuffer) -> (usize, u32) {
        let mut mask = self.first[buf.peek() as usize];
        if mask == 0 {
            return (0, 0);
        }
        let mut len = 1;
        loop {
            let c = buf.at(len);
            if c == 0 {
                break;
            }
            let table = if len == 1 { &self.second } else { &self.rest };
            let next = mask & table[c as usize];
            if next == 0 {
                break;
            }
            mask = next;
            len += 1;
        }
        (len, mask)
    }

    /// Longest fixed match at the cursor.
    fn fixed_match(&self, buf: &SourceBuffer, scratch: &mut String) -> (usize, u32) {
        scratch.clear();
        let mut best = (0, 0);
        for i in 0..self.max_fixed_len {
            let c = buf.at(i);
            if c == 0 || c == b'\n' {
                break;
            }
            scratch.push(c.to_ascii_uppercase() as char);
            if let Some(&token) = self.fixed.get(scratch.as_str()) {
                best = (i + 1, token);
            }
        }
        best
    }
}

/// Lexer scanning mode. `MacroArgs` captures raw comma-delimited text in
/// place of normal token scanning while a macro invocation's arguments are
/// being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    MacroArgs,
}

/// Read access the lexer needs into the symbol table for `{name}`
/// interpolation inside string literals.
pub trait SymbolSource {
    fn string_value(&self, name: &str) -> Option<String>;
}

/// A `SymbolSource` with no symbols, for contexts without a table.
pub struct NoSymbols;

impl SymbolSource for NoSymbols {
    fn string_value(&self, _name: &str) -> Option<String> {
        None
    }
}

pub struct Lexer<'a> {
    rules: &'a Rules,
    mode: Mode,
    stack: Vec<Context>,
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(rules: &'a Rules, file: String, buf: SourceBuffer) -> Self {
        Self {
            rules,
            mode: Mode::Normal,
            stack: vec![Context {
                buf,
                file,
                args: None,
            }],
            at_line_start: true,
        }
    }

    pub fn push_context(&mut self, file: String, buf: SourceBuffer, args: Option<MacroArgs>) {
        self.stack.push(Context { buf, file, args });
        self.at_line_start = true;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Context stack depth; lets the driver notice when a pushed body has
    /// been consumed.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Raw text of the rest of the current line, consumed including the
    /// newline. `None` once the current buffer is exhausted. Used for macro
    /// and repeat body capture, which must end in the buffer it started in.
    pub fn capture_line(&mut self) -> Option<String> {
        let ctx = self.stack.last_mut()?;
        if ctx.buf.at_end() {
            return None;
        }
        let mut line = String::new();
        loop {
            let c = ctx.buf.peek();
            match c {
                0 => break,
                b'\n' => {
                    ctx.buf.advance(1);
                    line.push('\n');
                    break;
                }
                _ => {
                    ctx.buf.advance(1);
                    line.push(c as char);
                }
            }
        }
        self.at_line_start = true;
        Some(line)
    }

    pub fn file(&self) -> &str {
        match self.stack.last() {
            Some(ctx) => &ctx.file,
            None => "<eof>",
        }
    }

    pub fn line(&self) -> u32 {
        match self.stack.last() {
            Some(ctx) => ctx.buf.line(),
            None => 0,
        }
    }

    /// Argument count of the innermost macro frame, if lexing a macro body.
    pub fn narg(&self) -> Option<u32> {
        self.stack
            .last()
            .and_then(|ctx| ctx.args.as_ref())
            .map(|args| args.args.len() as u32)
    }

    pub fn macro_args(&self) -> Option<&MacroArgs> {
        self.stack.last().and_then(|ctx| ctx.args.as_ref())
    }

    pub fn fatal(&self, msg: &str) -> io::Error {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("{}:{}: {msg}", self.file(), self.line()),
        )
    }

    fn lift(&self, err: Diag) -> io::Error {
        self.fatal(err.message())
    }

    /// Up to `len` unconsumed bytes at the cursor, without advancing. Lets
    /// a parser disambiguate on raw text before committing to a token.
    pub fn peek_str(&self, len: usize) -> Option<String> {
        let ctx = self.stack.last()?;
        let mut text = String::with_capacity(len);
        for i in 0..len {
            let c = ctx.buf.at(i);
            if c == 0 || c == b'\n' {
                break;
            }
            text.push(c as char);
        }
        Some(text)
    }

    /// Splice text back in front of the cursor (string-equate expansion).
    pub fn unget_str(&mut self, s: &str) -> io::Result<()> {
        match self.stack.last_mut() {
            Some(ctx) => ctx.buf.unget_str(s.as_bytes()).map_err(|e| {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{}:{}: {}", ctx.file, ctx.buf.line(), e.message()),
                )
            }),
            None => Ok(()),
        }
    }

    pub fn next_token(
        &mut self,
        syms: &dyn SymbolSource,
        diag: &mut Diagnostics,
    ) -> io::Result<Token> {
        loop {
            let Some(ctx) = self.stack.last_mut() else {
                return Ok(Token::fixed(EOF));
            };
            // Whitespace and `\` line continuations. Leading whitespace
            // means the next identifier is not in label position.
            loop {
                match ctx.buf.peek() {
                    b' ' | b'\t' => {
                        ctx.buf.advance(1);
                        self.at_line_start = false;
                    }
                    b'\\' if ctx.buf.at(1) == b'\n' => ctx.buf.advance(2),
                    _ => break,
                }
            }
            if ctx.buf.at_end() {
                self.stack.pop();
                if self.stack.is_empty() {
                    return Ok(Token::fixed(EOF));
                }
                self.at_line_start = true;
                continue;
            }
            if self.mode == Mode::MacroArgs {
                return self.next_macro_arg(diag);
            }
            let line_start = self.at_line_start;
            self.at_line_start = false;
            let c = ctx.buf.peek();
            if c == b'\n' {
                ctx.buf.advance(1);
                self.at_line_start = true;
                return Ok(Token::fixed(NEWLINE));
            }
            if c == b'"' {
                let text = self.scan_string(syms, diag)?;
                return Ok(Token {
                    kind: STRING,
                    value: TokenValue::Text(text),
                });
            }
            let (float_len, float_mask) = self.rules.float_match(&ctx.buf);
            let mut scratch = String::with_capacity(self.rules.max_fixed_len);
            let (fixed_len, fixed_token) = self.rules.fixed_match(&ctx.buf, &mut scratch);
            // A fixed token wins ties with a floating match of equal length.
            if fixed_len > 0 && fixed_len >= float_len {
                let Some(ctx) = self.stack.last_mut() else {
                    return Ok(Token::fixed(EOF));
                };
                ctx.buf.advance(fixed_len);
                return Ok(Token::fixed(fixed_token));
            }
            if float_len > 0 {
                // Lowest set bit: earliest-registered class wins.
                let class = &self.rules.floats[float_mask.trailing_zeros() as usize];
                let token = match (line_start, class.line_start_token) {
                    (true, Some(t)) => t,
                    _ => class.token,
                };
                let Some(ctx) = self.stack.last_mut() else {
                    return Ok(Token::fixed(EOF));
                };
                match class.callback {
                    Some(callback) => match callback(ctx, float_len) {
                        Ok(FloatOutcome::Token(num)) => {
                            ctx.buf.advance(float_len);
                            return Ok(Token {
                                kind: token,
                                value: TokenValue::Num(num),
                            });
                        }
                        Ok(FloatOutcome::Rescan) => continue,
                        Err(e) => return Err(self.lift(e)),
                    },
                    None => {
                        let mut text = String::with_capacity(float_len);
                        for i in 0..float_len {
                            text.push(ctx.buf.at(i) as char);
                        }
                        ctx.buf.advance(float_len);
                        return Ok(Token {
                            kind: token,
                            value: TokenValue::Text(text),
                        });
                    }
                }
            }
            // No rule claims it: hand back the raw byte.
            let Some(ctx) = self.stack.last_mut() else {
                return Ok(Token::fixed(EOF));
            };
            ctx.buf.advance(1);
            return Ok(Token::fixed(c as u32));
        }
    }

    /// Raw macro-argument capture: everything up to an unescaped `,` or end
    /// of line, with trailing whitespace trimmed.
    fn next_macro_arg(&mut self, diag: &mut Diagnostics) -> io::Result<Token> {
        let Some(ctx) = self.stack.last_mut() else {
            return Ok(Token::fixed(EOF));
        };
        let c = ctx.buf.peek();
        if c == b'\n' {
            ctx.buf.advance(1);
            self.at_line_start = true;
            return Ok(Token::fixed(NEWLINE));
        }
        if c == b',' {
            ctx.buf.advance(1);
            return Ok(Token::fixed(b',' as u32));
        }
        let mut text = String::new();
        loop {
            let c = ctx.buf.peek();
            match c {
                0 | b'\n' | b',' => break,
                b'\\' => {
                    let next = ctx.buf.at(1);
                    ctx.buf.advance(2);
                    let expansion = Self::escape_expansion(next, &ctx.args);
                    match expansion {
                        Some(s) => text.push_str(&s),
                        None => {
                            diag.error(format_args!(
                                "{}:{}: invalid escape `\\{}`",
                                ctx.file,
                                ctx.buf.line(),
                                next as char
                            ));
                        }
                    }
                }
                _ => {
                    ctx.buf.advance(1);
                    text.push(c as char);
                }
            }
            if text.len() > MAX_STR_LEN {
                return Err(err_at(&ctx.file, ctx.buf.line(), "macro argument too long"));
            }
        }
        while text.ends_with([' ', '\t']) {
            text.pop();
        }
        Ok(Token {
            kind: STRING,
            value: TokenValue::Text(text),
        })
    }

    fn escape_expansion(c: u8, args: &Option<MacroArgs>) -> Option<String> {
        match c {
            b'\\' => Some("\\".to_string()),
            b'"' => Some("\"".to_string()),
            b',' => Some(",".to_string()),
            b'{' => Some("{".to_string()),
            b'}' => Some("}".to_string()),
            b'n' => Some("\n".to_string()),
            b't' => Some("\t".to_string()),
            b'1'..=b'9' => args
                .as_ref()
                .and_then(|a| a.get((c - b'0') as usize))
                .map(|s| s.to_string()),
            b'@' => args.as_ref().map(|a| a.unique_name()),
            _ => None,
        }
    }

    fn scan_string(
        &mut self,
        syms: &dyn SymbolSource,
        diag: &mut Diagnostics,
    ) -> io::Result<String> {
        let Some(ctx) = self.stack.last_mut() else {
            return Ok(String::new());
        };
        ctx.buf.advance(1);
        let mut text = String::new();
        loop {
            let c = ctx.buf.peek();
            match c {
                0 | b'\n' => return Err(err_at(&ctx.file, ctx.buf.line(), "unterminated string")),
                b'"' => {
                    ctx.buf.advance(1);
                    return Ok(text);
                }
                b'\\' => {
                    let next = ctx.buf.at(1);
                    match Self::escape_expansion(next, &ctx.args) {
                        Some(s) => {
                            ctx.buf.advance(2);
                            text.push_str(&s);
                        }
                        None if next.is_ascii_digit() || next == b'@' => {
                            return Err(err_at(&ctx.file, ctx.buf.line(), "macro argument not defined"));
                        }
                        None => {
                            return Err(err_at(&ctx.file, ctx.buf.line(), "invalid escape in string"));
                        }
                    }
                }
                b'{' => {
                    ctx.buf.advance(1);
                    let mut name = String::new();
                    loop {
                        let c = ctx.buf.peek();
                        match c {
                            0 | b'\n' | b'"' => {
                                return Err(err_at(&ctx.file, ctx.buf.line(), "unterminated interpolation"));
                            }
                            b'}' => {
                                ctx.buf.advance(1);
                                break;
                            }
                            _ => {
                                ctx.buf.advance(1);
                                name.push(c as char);
                                if name.len() > MAX_STR_LEN {
                                    return Err(err_at(&ctx.file, ctx.buf.line(), "symbol name too long"));
                                }
                            }
                        }
                    }
                    match syms.string_value(&name) {
                        Some(value) => text.push_str(&value),
                        None => {
                            diag.error(format_args!(
                                "{}:{}: interpolated symbol `{name}` does not exist",
                                ctx.file,
                                ctx.buf.line()
                            ));
                        }
                    }
                }
                _ => {
                    ctx.buf.advance(1);
                    text.push(c as char);
                }
            }
            if text.len() > MAX_STR_LEN {
                return Err(err_at(&ctx.file, ctx.buf.line(), "string too long"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T_ID: u32 = 0x100;
    const T_LABEL: u32 = 0x101;
    const T_NUM: u32 = 0x102;
    const T_ALT: u32 = 0x103;

    fn ident_first(c: u8) -> bool {
        c.is_ascii_alphabetic() || c == b'_' || c == b'.'
    }

    fn ident_rest(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
    }

    fn digit(c: u8) -> bool {
        c.is_ascii_digit()
    }

    fn parse_dec(ctx: &mut Context, len: usize) -> DiagResult<FloatOutcome> {
        let mut value = 0u32;
        for i in 0..len {
            value = value
                .wrapping_mul(10)
                .wrapping_add((ctx.buf.at(i) - b'0') as u32);
        }
        Ok(FloatOutcome::Token(value as i32))
    }

    fn test_rules() -> Rules {
        let mut rules = Rules::new();
        rules
            .add_float(FloatSpec {
                first: ident_first,
                second: ident_rest,
                rest: ident_rest,
                token: T_ID,
                line_start_token: Some(T_LABEL),
                callback: None,
            })
            .unwrap();
        rules
            .add_float(FloatSpec {
                first: digit,
                second: digit,
                rest: digit,
                token: T_NUM,
                line_start_token: None,
                callback: Some(parse_dec),
            })
            .unwrap();
        rules.add_fixed("ADD", 0x200);
        rules.add_fixed("<", 0x201);
        rules.add_fixed("<<", 0x202);
        rules
    }

    fn lex_kinds(rules: &Rules, src: &str) -> Vec<u32> {
        let mut lexer = Lexer::new(rules, "test".into(), SourceBuffer::from_str(src));
        let mut diag = Diagnostics::new();
        let mut kinds = Vec::new();
        loop {
            let tok = lexer.next_token(&NoSymbols, &mut diag).unwrap();
            if tok.kind == EOF {
                break;
            }
            kinds.push(tok.kind);
        }
        kinds
    }

    #[test]
    fn longest_fixed_match_wins() {
        let rules = test_rules();
        assert_eq!(lex_kinds(&rules, " <<<"), vec![0x202, 0x201, NEWLINE]);
    }

    #[test]
    fn fixed_beats_float_on_tie() {
        let rules = test_rules();
        // `ADD` matches both the keyword and the identifier class at the
        // same length, so the keyword wins; one more character flips it.
        assert_eq!(lex_kinds(&rules, " ADD"), vec![0x200, NEWLINE]);
        assert_eq!(lex_kinds(&rules, " ADDX"), vec![T_ID, NEWLINE]);
    }

    #[test]
    fn idents_promote_to_labels_at_line_start() {
        let rules = test_rules();
        assert_eq!(
            lex_kinds(&rules, "foo bar\n  baz"),
            vec![T_LABEL, T_ID, NEWLINE, T_ID, NEWLINE]
        );
    }

    #[test]
    fn earliest_registered_class_wins_overlap() {
        let mut rules = Rules::new();
        rules
            .add_float(FloatSpec {
                first: ident_first,
                second: ident_rest,
                rest: ident_rest,
                token: T_ID,
                line_start_token: None,
                callback: None,
            })
            .unwrap();
        rules
            .add_float(FloatSpec {
                first: ident_first,
                second: ident_rest,
                rest: ident_rest,
                token: T_ALT,
                line_start_token: None,
                callback: None,
            })
            .unwrap();
        assert_eq!(lex_kinds(&rules, "x"), vec![T_ID, NEWLINE]);
    }

    #[test]
    fn number_callback_parses_value() {
        let rules = test_rules();
        let mut lexer = Lexer::new(&rules, "test".into(), SourceBuffer::from_str(" 1234"));
        let mut diag = Diagnostics::new();
        let tok = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(tok.kind, T_NUM);
        assert_eq!(tok.num(), 1234);
    }

    #[test]
    fn comments_are_blanked() {
        let rules = test_rules();
        assert_eq!(lex_kinds(&rules, "x ; y z\n1"), vec![T_LABEL, NEWLINE, T_NUM, NEWLINE]);
    }

    #[test]
    fn string_escapes() {
        let rules = test_rules();
        let mut lexer = Lexer::new(
            &rules,
            "test".into(),
            SourceBuffer::from_str(r#" "a\tb\\c\"d" "#),
        );
        let mut diag = Diagnostics::new();
        let tok = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(tok.kind, STRING);
        assert_eq!(tok.text(), "a\tb\\c\"d");
    }

    #[test]
    fn macro_args_expand_in_strings() {
        let rules = test_rules();
        let mut lexer = Lexer::new(&rules, "test".into(), SourceBuffer::from_str(""));
        lexer.push_context(
            "macro".into(),
            SourceBuffer::from_str(r#""\1 and \@""#),
            Some(MacroArgs {
                args: vec!["one".into()],
                unique: 7,
            }),
        );
        let mut diag = Diagnostics::new();
        let tok = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(tok.text(), "one and _7");
    }

    #[test]
    fn interpolation_reads_symbol_source() {
        struct One;
        impl SymbolSource for One {
            fn string_value(&self, name: &str) -> Option<String> {
                (name == "V").then(|| "val".to_string())
            }
        }
        let rules = test_rules();
        let mut lexer = Lexer::new(&rules, "test".into(), SourceBuffer::from_str(r#""<{V}>""#));
        let mut diag = Diagnostics::new();
        let tok = lexer.next_token(&One, &mut diag).unwrap();
        assert_eq!(tok.text(), "<val>");
        assert_eq!(diag.error_count(), 0);
    }

    #[test]
    fn missing_interpolation_reports_and_continues() {
        let rules = test_rules();
        let mut lexer = Lexer::new(&rules, "test".into(), SourceBuffer::from_str(r#""{NOPE}x""#));
        let mut diag = Diagnostics::new();
        let tok = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(tok.text(), "x");
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn pushback_margin_is_bounded() {
        let mut buf = SourceBuffer::from_str("x");
        let too_big = vec![b'a'; SAFETY_MARGIN + 1];
        assert!(buf.unget_str(&too_big).is_err());
    }

    #[test]
    fn contexts_pop_back_to_outer_buffer() {
        let rules = test_rules();
        let mut lexer = Lexer::new(&rules, "outer".into(), SourceBuffer::from_str(" 1"));
        lexer.push_context("inner".into(), SourceBuffer::from_str(" 2"), None);
        let mut diag = Diagnostics::new();
        let a = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(a.num(), 2);
        assert_eq!(lexer.next_token(&NoSymbols, &mut diag).unwrap().kind, NEWLINE);
        let b = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(b.num(), 1);
    }

    #[test]
    fn macro_arg_mode_captures_raw_text() {
        let rules = test_rules();
        let mut lexer = Lexer::new(
            &rules,
            "test".into(),
            SourceBuffer::from_str("a + b , c\\, d\n"),
        );
        lexer.set_mode(Mode::MacroArgs);
        let mut diag = Diagnostics::new();
        let a = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(a.text(), "a + b");
        assert_eq!(lexer.next_token(&NoSymbols, &mut diag).unwrap().kind, b',' as u32);
        let b = lexer.next_token(&NoSymbols, &mut diag).unwrap();
        assert_eq!(b.text(), "c, d");
        assert_eq!(lexer.next_token(&NoSymbols, &mut diag).unwrap().kind, NEWLINE);
    }
}
