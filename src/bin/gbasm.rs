use std::{
    error::Error,
    fs::File,
    io::{self, BufWriter, ErrorKind, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use gbasm::{
    diag::{Diag, DiagResult, Diagnostics},
    expr::{BinaryOp, Expr, UnknownExpr},
    lexer::{
        self, Context, FloatOutcome, FloatSpec, Lexer, MacroArgs, Mode, Rules, SourceBuffer,
        Token,
    },
    patch::{Assertion, AssertKind, Patch, PatchKind, NO_PC_SECTION},
    symbol::{EvalContext, StringValue, SymbolKind, SymbolTable},
    Section,
};
use tracing::Level;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file
    source: PathBuf,

    /// Output object file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pre-defined symbols (repeatable)
    #[arg(short = 'D', long, value_name="KEY1=val", value_parser = gbasm::parse_defines::<String, i32>)]
    define: Vec<(String, i32)>,

    /// Search directories for included files
    #[arg(short = 'I', long)]
    include: Vec<PathBuf>,

    /// Export every defined symbol
    #[arg(short, long)]
    export_all: bool,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = main_real(args) {
        tracing::error!("{e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main_real(args: Args) -> Result<(), Box<dyn Error>> {
    let source = args.source.to_string_lossy().into_owned();
    let buf = SourceBuffer::from_file(&args.source)?;

    let rules = rules();
    let mut asm = Asm::new(&rules, source, buf, args.include);
    asm.syms.set_export_all(args.export_all);
    for (name, value) in &args.define {
        let result = asm.syms.add_equ(name, *value, "<command line>", 0);
        asm.check(result)?;
    }

    tracing::trace!("assembling");
    asm.pass()?;
    if asm.diag.error_count() > 0 {
        return Err(format!("assembly failed with {} error(s)", asm.diag.error_count()).into());
    }

    tracing::trace!("writing");
    let mut output: Box<dyn Write> = match args.output {
        Some(path) => Box::new(BufWriter::new(
            File::options()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| format!("cant open file: {e}"))?,
        )),
        None => Box::new(io::stdout()),
    };
    write_object(&mut asm, &mut output)?;
    Ok(())
}

/// Token codes. Raw single characters keep their byte values; everything
/// else lives above them.
#[rustfmt::skip]
mod tok {
    // floating classes
    pub const ID: u32      = 0x100;
    pub const LABEL: u32   = 0x101;
    pub const NUMBER: u32  = 0x102;

    // multi-character operators
    pub const SHL: u32     = 0x110;
    pub const SHR: u32     = 0x111;
    pub const LOGAND: u32  = 0x112;
    pub const LOGOR: u32   = 0x113;
    pub const EQ: u32      = 0x114;
    pub const NE: u32      = 0x115;
    pub const GE: u32      = 0x116;
    pub const LE: u32      = 0x117;
    pub const EXP: u32     = 0x118;
    pub const DCOLON: u32  = 0x119;

    // single characters used in patterns
    pub const PLUS: u32    = b'+' as u32;
    pub const MINUS: u32   = b'-' as u32;
    pub const STAR: u32    = b'*' as u32;
    pub const SLASH: u32   = b'/' as u32;
    pub const PERCENT: u32 = b'%' as u32;
    pub const AMP: u32     = b'&' as u32;
    pub const PIPE: u32    = b'|' as u32;
    pub const CARET: u32   = b'^' as u32;
    pub const TILDE: u32   = b'~' as u32;
    pub const BANG: u32    = b'!' as u32;
    pub const LT: u32      = b'<' as u32;
    pub const GT: u32      = b'>' as u32;
    pub const LPAREN: u32  = b'(' as u32;
    pub const RPAREN: u32  = b')' as u32;
    pub const COMMA: u32   = b',' as u32;
    pub const COLON: u32   = b':' as u32;

    // directives
    pub const SECTION: u32 = 0x200;
    pub const INCLUDE: u32 = 0x201;
    pub const DB: u32      = 0x202;
    pub const DW: u32      = 0x203;
    pub const DS: u32      = 0x204;
    pub const EXPORT: u32  = 0x205;
    pub const PURGE: u32   = 0x206;
    pub const ASSERT: u32  = 0x207;
    pub const IF: u32      = 0x208;
    pub const ELSE: u32    = 0x209;
    pub const ENDC: u32    = 0x20A;
    pub const MACRO: u32   = 0x20B;
    pub const ENDM: u32    = 0x20C;
    pub const REPT: u32    = 0x20D;
    pub const ENDR: u32    = 0x20E;
    pub const EQU: u32     = 0x20F;
    pub const SET: u32     = 0x210;
    pub const EQUS: u32    = 0x211;
    pub const ORG: u32     = 0x212;
    pub const BANK: u32    = 0x213;
    pub const HIGH: u32    = 0x214;
    pub const LOW: u32     = 0x215;
    pub const ISCONST: u32 = 0x216;
    pub const DEF: u32     = 0x217;
    pub const WARN: u32    = 0x218;
    pub const FAIL: u32    = 0x219;

    // mnemonics
    pub const NOP: u32     = 0x300;
    pub const HALT: u32    = 0x301;
    pub const STOP: u32    = 0x302;
    pub const DI: u32      = 0x303;
    pub const EI: u32      = 0x304;
    pub const RET: u32     = 0x305;
    pub const RETI: u32    = 0x306;
    pub const RST: u32     = 0x307;
    pub const ADD: u32     = 0x308;
    pub const ADC: u32     = 0x309;
    pub const SUB: u32     = 0x30A;
    pub const SBC: u32     = 0x30B;
    pub const AND: u32     = 0x30C;
    pub const XOR: u32     = 0x30D;
    pub const OR: u32      = 0x30E;
    pub const CP: u32      = 0x30F;
    pub const INC: u32     = 0x310;
    pub const DEC: u32     = 0x311;
    pub const LD: u32      = 0x312;
    pub const LDH: u32     = 0x313;
    pub const JP: u32      = 0x314;
    pub const JR: u32      = 0x315;
    pub const CALL: u32    = 0x316;
    pub const PUSH: u32    = 0x317;
    pub const POP: u32     = 0x318;
    pub const CPL: u32     = 0x319;
    pub const SCF: u32     = 0x31A;
    pub const CCF: u32     = 0x31B;
    pub const DAA: u32     = 0x31C;

    // registers and conditions
    pub const A: u32       = 0x400;
    pub const B: u32       = 0x401;
    pub const C: u32       = 0x402;
    pub const D: u32       = 0x403;
    pub const E: u32       = 0x404;
    pub const H: u32       = 0x405;
    pub const L: u32       = 0x406;
    pub const AF: u32      = 0x407;
    pub const BC: u32      = 0x408;
    pub const DE: u32      = 0x409;
    pub const HL: u32      = 0x40A;
    pub const SP: u32      = 0x40B;
    pub const NZ: u32      = 0x40C;
    pub const Z: u32       = 0x40D;
    pub const NC: u32      = 0x40E;
}

fn ident_first(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'.' || c == b'@'
}

fn ident_rest(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'@'
}

fn dec_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn hex_lead(c: u8) -> bool {
    c == b'$'
}

fn hex_digit(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

fn bin_lead(c: u8) -> bool {
    c == b'%'
}

fn bin_digit(c: u8) -> bool {
    c == b'0' || c == b'1'
}

fn macro_arg_lead(c: u8) -> bool {
    c == b'\\'
}

fn macro_arg_digit(c: u8) -> bool {
    c.is_ascii_digit() && c != b'0' || c == b'@'
}

fn never(_c: u8) -> bool {
    false
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

fn parse_hex(ctx: &mut Context, len: usize) -> DiagResult<FloatOutcome> {
    if len < 2 {
        return Err(Diag::fatal("missing digits after `$`"));
    }
    let mut value = 0u32;
    for i in 1..len {
        let c = ctx.buf.at(i);
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            _ => c - b'A' + 10,
        };
        value = value.wrapping_mul(16).wrapping_add(digit as u32);
    }
    Ok(FloatOutcome::Token(value as i32))
}

fn parse_bin(ctx: &mut Context, len: usize) -> DiagResult<FloatOutcome> {
    let mut value = 0u32;
    for i in 1..len {
        value = value.wrapping_shl(1) | (ctx.buf.at(i) - b'0') as u32;
    }
    Ok(FloatOutcome::Token(value as i32))
}

/// `\1`..`\9` and `\@` outside strings: splice the argument text into the
/// buffer and scan again.
fn splice_macro_arg(ctx: &mut Context, len: usize) -> DiagResult<FloatOutcome> {
    let c = ctx.buf.at(1);
    let text = match &ctx.args {
        None => return Err(Diag::fatal("macro argument outside of a macro")),
        Some(args) if c == b'@' => args.unique_name(),
        Some(args) => match args.get((c - b'0') as usize) {
            Some(text) => text.to_string(),
            None => return Err(Diag::fatal("macro argument not defined")),
        },
    };
    ctx.buf.advance(len);
    ctx.buf.unget_str(text.as_bytes())?;
    Ok(FloatOutcome::Rescan)
}

fn rules() -> Rules {
    let mut rules = Rules::new();
    for spec in [
        FloatSpec {
            first: ident_first,
            second: ident_rest,
            rest: ident_rest,
            token: tok::ID,
            line_start_token: Some(tok::LABEL),
            callback: None,
        },
        FloatSpec {
            first: dec_digit,
            second: dec_digit,
            rest: dec_digit,
            token: tok::NUMBER,
            line_start_token: None,
            callback: Some(parse_dec),
        },
        FloatSpec {
            first: hex_lead,
            second: hex_digit,
            rest: hex_digit,
            token: tok::NUMBER,
            line_start_token: None,
            callback: Some(parse_hex),
        },
        FloatSpec {
            first: bin_lead,
            second: bin_digit,
            rest: bin_digit,
            token: tok::NUMBER,
            line_start_token: None,
            callback: Some(parse_bin),
        },
        FloatSpec {
            first: macro_arg_lead,
            second: macro_arg_digit,
            rest: never,
            token: tok::NUMBER,
            line_start_token: None,
            callback: Some(splice_macro_arg),
        },
    ] {
        // Registration order defines the overlap tie-break.
        if let Err(e) = rules.add_float(spec) {
            unreachable!("float class registration: {}", e.message());
        }
    }
    for (text, token) in [
        ("<<", tok::SHL),
        (">>", tok::SHR),
        ("&&", tok::LOGAND),
        ("||", tok::LOGOR),
        ("==", tok::EQ),
        ("!=", tok::NE),
        (">=", tok::GE),
        ("<=", tok::LE),
        ("**", tok::EXP),
        ("::", tok::DCOLON),
        ("SECTION", tok::SECTION),
        ("INCLUDE", tok::INCLUDE),
        ("DB", tok::DB),
        ("DW", tok::DW),
        ("DS", tok::DS),
        ("EXPORT", tok::EXPORT),
        ("GLOBAL", tok::EXPORT),
        ("PURGE", tok::PURGE),
        ("ASSERT", tok::ASSERT),
        ("IF", tok::IF),
        ("ELSE", tok::ELSE),
        ("ENDC", tok::ENDC),
        ("MACRO", tok::MACRO),
        ("ENDM", tok::ENDM),
        ("REPT", tok::REPT),
        ("ENDR", tok::ENDR),
        ("EQU", tok::EQU),
        ("SET", tok::SET),
        ("EQUS", tok::EQUS),
        ("ORG", tok::ORG),
        ("BANK", tok::BANK),
        ("HIGH", tok::HIGH),
        ("LOW", tok::LOW),
        ("ISCONST", tok::ISCONST),
        ("DEF", tok::DEF),
        ("WARN", tok::WARN),
        ("FAIL", tok::FAIL),
        ("NOP", tok::NOP),
        ("HALT", tok::HALT),
        ("STOP", tok::STOP),
        ("DI", tok::DI),
        ("EI", tok::EI),
        ("RET", tok::RET),
        ("RETI", tok::RETI),
        ("RST", tok::RST),
        ("ADD", tok::ADD),
        ("ADC", tok::ADC),
        ("SUB", tok::SUB),
        ("SBC", tok::SBC),
        ("AND", tok::AND),
        ("XOR", tok::XOR),
        ("OR", tok::OR),
        ("CP", tok::CP),
        ("INC", tok::INC),
        ("DEC", tok::DEC),
        ("LD", tok::LD),
        ("LDH", tok::LDH),
        ("JP", tok::JP),
        ("JR", tok::JR),
        ("CALL", tok::CALL),
        ("PUSH", tok::PUSH),
        ("POP", tok::POP),
        ("CPL", tok::CPL),
        ("SCF", tok::SCF),
        ("CCF", tok::CCF),
        ("DAA", tok::DAA),
        ("A", tok::A),
        ("B", tok::B),
        ("C", tok::C),
        ("D", tok::D),
        ("E", tok::E),
        ("H", tok::H),
        ("L", tok::L),
        ("AF", tok::AF),
        ("BC", tok::BC),
        ("DE", tok::DE),
        ("HL", tok::HL),
        ("SP", tok::SP),
        ("NZ", tok::NZ),
        ("Z", tok::Z),
        ("NC", tok::NC),
    ] {
        rules.add_fixed(text, token);
    }
    rules
}

/// Read-only evaluation context over the assembler's current position.
macro_rules! eval_ctx {
    ($asm:expr) => {
        EvalContext {
            sections: &$asm.sections,
            current_section: $asm.current_section,
            pc_offset: match $asm.current_section {
                Some(idx) => $asm.sections[idx].data.len() as u32,
                None => 0,
            },
            narg: $asm.lexer.narg(),
            file: $asm.lexer.file(),
            line: $asm.lexer.line(),
        }
    };
}

struct Asm<'a> {
    lexer: Lexer<'a>,
    syms: SymbolTable,
    sections: Vec<Section>,
    assertions: Vec<Assertion>,
    current_section: Option<usize>,
    include_dirs: Vec<PathBuf>,
    diag: Diagnostics,
    tok: Token,
    /// Saved label scopes, keyed by the lexer depth they belong to.
    scope_stack: Vec<(usize, Option<String>)>,
    /// Macro invocations so far, for `\@`.
    unique: u32,
    if_level: usize,
    /// Suppresses string-equate expansion while reading `PURGE`/`DEF` names.
    no_expand: bool,
}

impl<'a> Asm<'a> {
    fn new(rules: &'a Rules, file: String, buf: SourceBuffer, include_dirs: Vec<PathBuf>) -> Self {
        Self {
            lexer: Lexer::new(rules, file, buf),
            syms: SymbolTable::new(),
            sections: Vec::new(),
            assertions: Vec::new(),
            current_section: None,
            include_dirs,
            diag: Diagnostics::new(),
            tok: Token::fixed(lexer::EOF),
            scope_stack: Vec::new(),
            unique: 0,
            if_level: 0,
            no_expand: false,
        }
    }

    fn err(&self, msg: &str) -> io::Error {
        self.lexer.fatal(msg)
    }

    /// Lift a core-module result: fatal aborts, recoverable reports here
    /// and hands back a placeholder via `Default`.
    fn check<T: Default>(&mut self, result: DiagResult<T>) -> io::Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(Diag::Error(msg)) => {
                self.diag.error(format_args!(
                    "{}:{}: {msg}",
                    self.lexer.file(),
                    self.lexer.line()
                ));
                Ok(T::default())
            }
            Err(e @ Diag::Fatal(_)) => Err(self.err(e.message())),
        }
    }

    /// Advance the lookahead, restoring saved scopes when macro bodies end
    /// and splicing string equates back into the stream.
    fn next(&mut self) -> io::Result<()> {
        loop {
            self.tok = self.lexer.next_token(&self.syms, &mut self.diag)?;
            while let Some((depth, _)) = self.scope_stack.last() {
                if self.lexer.depth() >= *depth {
                    break;
                }
                if let Some((_, scope)) = self.scope_stack.pop() {
                    self.syms.set_scope(scope);
                }
            }
            if self.tok.kind == tok::ID && !self.no_expand {
                if let Ok(Some(sym)) = self.syms.find_scoped(self.tok.text()) {
                    if let SymbolKind::Equs(value) = &sym.kind {
                        let text = match value {
                            StringValue::Stored(s) => s.clone(),
                            StringValue::Computed(cb) => cb(&eval_ctx!(self)),
                        };
                        self.lexer.unget_str(&text)?;
                        continue;
                    }
                }
            }
            return Ok(());
        }
    }

    fn expect(&mut self, kind: u32, what: &str) -> io::Result<()> {
        if self.tok.kind != kind {
            return Err(self.err(&format!("expected {what}")));
        }
        self.next()
    }

    fn eat_if(&mut self, kind: u32) -> io::Result<bool> {
        if self.tok.kind == kind {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn pass(&mut self) -> io::Result<()> {
        self.next()?;
        loop {
            match self.tok.kind {
                lexer::EOF => break,
                lexer::NEWLINE => self.next()?,
                _ => self.statement()?,
            }
        }
        if self.if_level != 0 {
            return Err(self.err("unterminated IF block"));
        }
        Ok(())
    }

    fn statement(&mut self) -> io::Result<()> {
        match self.tok.kind {
            tok::LABEL => self.label_statement(),
            tok::COLON => {
                // A bare colon drops an anonymous label.
                self.next()?;
                let offset = self.pc_offset();
                let section = self.current_section;
                let result =
                    self.syms
                        .add_anon_label(section, offset, self.lexer.file(), self.lexer.line());
                self.check(result)
            }
            tok::SECTION => self.section_directive(),
            tok::INCLUDE => self.include_directive(),
            tok::DB => self.data_directive(PatchKind::Byte),
            tok::DW => self.data_directive(PatchKind::Word),
            tok::DS => self.ds_directive(),
            tok::EXPORT => self.export_directive(),
            tok::PURGE => self.purge_directive(),
            tok::ASSERT => self.assert_directive(),
            tok::IF => self.if_directive(),
            tok::ELSE => {
                if self.if_level == 0 {
                    return Err(self.err("ELSE outside of IF"));
                }
                self.skip_conditional(false)?;
                self.if_level -= 1;
                self.next()
            }
            tok::ENDC => {
                if self.if_level == 0 {
                    return Err(self.err("ENDC outside of IF"));
                }
                self.if_level -= 1;
                self.next()
            }
            tok::REPT => self.rept_directive(),
            tok::ID => self.invoke_macro(),
            kind if (tok::NOP..=tok::DAA).contains(&kind) => self.instruction(kind),
            _ => {
                self.diag.error(format_args!(
                    "{}:{}: unexpected token",
                    self.lexer.file(),
                    self.lexer.line()
                ));
                // Resynchronize on the next line.
                while self.tok.kind != lexer::NEWLINE && self.tok.kind != lexer::EOF {
                    self.next()?;
                }
                Ok(())
            }
        }
    }

    fn label_statement(&mut self) -> io::Result<()> {
        let name = self.tok.text().to_string();
        let file = self.lexer.file().to_string();
        let line = self.lexer.line();
        self.next()?;
        // A colon does not settle the statement: `Name: MACRO` is still a
        // definition. Eat it first, then dispatch on what follows.
        let export = self.tok.kind == tok::DCOLON;
        if !self.eat_if(tok::DCOLON)? {
            self.eat_if(tok::COLON)?;
        }
        match self.tok.kind {
            tok::EQU => {
                self.next()?;
                let value = self.const_expr()?;
                let result = self.syms.add_equ(&name, value, &file, line);
                self.check(result)
            }
            tok::SET => {
                self.next()?;
                let value = self.const_expr()?;
                let result = self.syms.add_set(&name, value, &file, line);
                self.check(result)
            }
            tok::EQUS => {
                self.next()?;
                if self.tok.kind != lexer::STRING {
                    return Err(self.err("expected string"));
                }
                let value = self.tok.text().to_string();
                self.next()?;
                let result = self.syms.add_string(&name, value, &file, line);
                self.check(result)
            }
            tok::MACRO => {
                let body = self.capture_body("ENDM", "REPT", "MACRO")?;
                let result = self.syms.add_macro(&name, body, &file, line);
                self.check(result)?;
                self.next()
            }
            _ => {
                let offset = self.pc_offset();
                let section = self.current_section;
                let result = self.syms.add_label(&name, section, offset, &file, line);
                self.check(result)?;
                if export {
                    let result = self.syms.export(&name, &file, line);
                    self.check(result)?;
                }
                Ok(())
            }
        }
    }

    fn section_directive(&mut self) -> io::Result<()> {
        self.next()?;
        if self.tok.kind != lexer::STRING {
            return Err(self.err("expected section name"));
        }
        let name = self.tok.text().to_string();
        self.next()?;
        let mut org = None;
        let mut bank = None;
        while self.eat_if(tok::COMMA)? {
            match self.tok.kind {
                tok::ORG => {
                    self.next()?;
                    org = Some(self.const_expr()? as u32);
                }
                tok::BANK => {
                    self.next()?;
                    bank = Some(self.const_expr()? as u32);
                }
                _ => return Err(self.err("expected ORG or BANK")),
            }
        }
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            self.diag.error(format_args!(
                "{}:{}: section `{name}` already defined",
                self.lexer.file(),
                self.lexer.line()
            ));
            self.current_section = Some(idx);
            return Ok(());
        }
        self.sections.push(Section::new(name, org, bank));
        self.current_section = Some(self.sections.len() - 1);
        // A new section starts a fresh local-label scope.
        self.syms.set_scope(None);
        Ok(())
    }

    fn include_directive(&mut self) -> io::Result<()> {
        self.next()?;
        if self.tok.kind != lexer::STRING {
            return Err(self.err("expected file name"));
        }
        let name = self.tok.text().to_string();
        self.next()?;
        let mut path = PathBuf::from(&name);
        if !path.is_file() {
            for dir in &self.include_dirs {
                let candidate = dir.join(&name);
                if candidate.is_file() {
                    path = candidate;
                    break;
                }
            }
        }
        let buf = SourceBuffer::from_file(&path)
            .map_err(|e| self.err(&format!("cant include `{name}`: {e}")))?;
        self.lexer
            .push_context(path.to_string_lossy().into_owned(), buf, None);
        self.next()
    }

    fn data_directive(&mut self, kind: PatchKind) -> io::Result<()> {
        self.next()?;
        loop {
            if self.tok.kind == lexer::STRING && kind == PatchKind::Byte {
                let bytes = self.tok.text().as_bytes().to_vec();
                self.next()?;
                self.emit(&bytes)?;
            } else {
                let value = self.expr()?;
                match kind {
                    PatchKind::Byte => self.emit_byte_expr(value)?,
                    _ => self.emit_word_expr(value)?,
                }
            }
            if !self.eat_if(tok::COMMA)? {
                break;
            }
        }
        Ok(())
    }

    fn ds_directive(&mut self) -> io::Result<()> {
        self.next()?;
        let count = self.const_expr()?;
        let mut fill = 0u8;
        if self.eat_if(tok::COMMA)? {
            fill = self.const_expr()? as u8;
        }
        if count < 0 {
            self.diag.error(format_args!(
                "{}:{}: negative DS size",
                self.lexer.file(),
                self.lexer.line()
            ));
            return Ok(());
        }
        let bytes = vec![fill; count as usize];
        self.emit(&bytes)
    }

    fn export_directive(&mut self) -> io::Result<()> {
        self.next()?;
        loop {
            if self.tok.kind != tok::ID && self.tok.kind != tok::LABEL {
                return Err(self.err("expected symbol name"));
            }
            let name = self.tok.text().to_string();
            let file = self.lexer.file().to_string();
            let line = self.lexer.line();
            self.next()?;
            let result = self.syms.export(&name, &file, line);
            self.check(result)?;
            if !self.eat_if(tok::COMMA)? {
                break;
            }
        }
        Ok(())
    }

    fn purge_directive(&mut self) -> io::Result<()> {
        self.no_expand = true;
        self.next()?;
        loop {
            if self.tok.kind != tok::ID && self.tok.kind != tok::LABEL {
                self.no_expand = false;
                return Err(self.err("expected symbol name"));
            }
            let name = self.tok.text().to_string();
            self.next()?;
            let result = self.syms.purge(&name);
            self.check(result)?;
            if !self.eat_if(tok::COMMA)? {
                break;
            }
        }
        self.no_expand = false;
        Ok(())
    }

    fn assert_directive(&mut self) -> io::Result<()> {
        self.next()?;
        let kind = match self.tok.kind {
            tok::WARN => {
                self.next()?;
                self.expect(tok::COMMA, "`,`")?;
                AssertKind::Warn
            }
            tok::FAIL => {
                self.next()?;
                self.expect(tok::COMMA, "`,`")?;
                AssertKind::Fatal
            }
            _ => AssertKind::Error,
        };
        let file = self.lexer.file().to_string();
        let line = self.lexer.line();
        let value = self.expr()?;
        let mut message = String::new();
        if self.eat_if(tok::COMMA)? {
            if self.tok.kind != lexer::STRING {
                return Err(self.err("expected string"));
            }
            message = self.tok.text().to_string();
            self.next()?;
        }
        match value {
            Expr::Known(v) => {
                if v != 0 {
                    return Ok(());
                }
                let msg = if message.is_empty() {
                    "assertion failed".to_string()
                } else {
                    format!("assertion failed: {message}")
                };
                match kind {
                    AssertKind::Warn => tracing::warn!("{file}:{line}: {msg}"),
                    AssertKind::Error => self.diag.error(format_args!("{file}:{line}: {msg}")),
                    AssertKind::Fatal => return Err(self.err(&msg)),
                }
                Ok(())
            }
            Expr::Unknown(e) => {
                // Outside a section the assertion has no PC context at all.
                let pc_section = self.current_section.unwrap_or(NO_PC_SECTION);
                let pc_offset = self.pc_offset();
                let result = Patch::new(
                    &file,
                    line,
                    PatchKind::Long,
                    0,
                    pc_section,
                    pc_offset,
                    &e,
                    &mut self.syms,
                );
                let patch = match result {
                    Ok(patch) => patch,
                    Err(e) => return Err(self.err(e.message())),
                };
                self.assertions.push(Assertion {
                    patch,
                    kind,
                    message,
                });
                Ok(())
            }
        }
    }

    fn if_directive(&mut self) -> io::Result<()> {
        self.next()?;
        let value = self.const_expr()?;
        if value != 0 {
            self.if_level += 1;
            return Ok(());
        }
        if self.skip_conditional(true)? {
            // Stopped at ELSE: assemble that branch until ENDC.
            self.if_level += 1;
        }
        self.next()
    }

    /// Skip tokens to the matching `ELSE` (when `stop_at_else`) or `ENDC`.
    /// Returns true when stopped at `ELSE`.
    fn skip_conditional(&mut self, stop_at_else: bool) -> io::Result<bool> {
        let mut depth = 0usize;
        loop {
            let token = self.lexer.next_token(&self.syms, &mut self.diag)?;
            match token.kind {
                lexer::EOF => return Err(self.err("unterminated IF block")),
                tok::IF => depth += 1,
                tok::ELSE if depth == 0 && stop_at_else => return Ok(true),
                tok::ENDC if depth == 0 => return Ok(false),
                tok::ENDC => depth -= 1,
                _ => {}
            }
        }
    }

    /// Collect raw body lines up to the matching end keyword. Nesting is
    /// tracked textually, the way the body will later re-lex.
    fn capture_body(&mut self, end: &str, nest_a: &str, nest_b: &str) -> io::Result<String> {
        // Discard the rest of the directive line, unless the lookahead
        // already consumed its newline.
        if self.tok.kind != lexer::NEWLINE && self.tok.kind != lexer::EOF {
            self.lexer.capture_line();
        }
        let mut body = String::new();
        let mut depth = 0usize;
        loop {
            let Some(line) = self.lexer.capture_line() else {
                return Err(self.err(&format!("unterminated block: missing {end}")));
            };
            let mut words = line
                .split_whitespace()
                .take(2)
                .map(|w| w.trim_end_matches(':').to_ascii_uppercase());
            let first = words.next().unwrap_or_default();
            let second = words.next().unwrap_or_default();
            let starts = |w: &str| w == nest_a || w == nest_b;
            let ends = |w: &str| w == "ENDM" || w == "ENDR";
            if (first == end || second == end) && depth == 0 {
                return Ok(body);
            }
            if starts(&first) || starts(&second) {
                depth += 1;
            } else if ends(&first) || ends(&second) {
                if depth == 0 {
                    return Err(self.err(&format!("expected {end}")));
                }
                depth -= 1;
            }
            body.push_str(&line);
        }
    }

    fn rept_directive(&mut self) -> io::Result<()> {
        self.next()?;
        let count = self.const_expr()?;
        let body = self.capture_body("ENDR", "REPT", "MACRO")?;
        if count > 0 {
            let repeated = body.repeat(count as usize);
            let args = self.lexer.macro_args().cloned();
            let file = format!("{}::REPT", self.lexer.file());
            self.lexer
                .push_context(file, SourceBuffer::from_str(&repeated), args);
        }
        self.next()
    }

    fn invoke_macro(&mut self) -> io::Result<()> {
        let name = self.tok.text().to_string();
        let body = match self.check(self.syms.find_scoped(&name).map(|s| s.cloned()))? {
            Some(sym) => match sym.kind {
                SymbolKind::Macro(body) => body,
                _ => {
                    self.diag.error(format_args!(
                        "{}:{}: `{name}` is not a macro",
                        self.lexer.file(),
                        self.lexer.line()
                    ));
                    while self.tok.kind != lexer::NEWLINE && self.tok.kind != lexer::EOF {
                        self.next()?;
                    }
                    return Ok(());
                }
            },
            None => {
                return Err(self.err(&format!("`{name}` is not defined")));
            }
        };
        self.lexer.set_mode(Mode::MacroArgs);
        self.next()?;
        let mut args = Vec::new();
        loop {
            match self.tok.kind {
                lexer::NEWLINE | lexer::EOF => break,
                tok::COMMA => self.next()?,
                lexer::STRING => {
                    args.push(self.tok.text().to_string());
                    self.next()?;
                }
                _ => {
                    self.lexer.set_mode(Mode::Normal);
                    return Err(self.err("expected macro argument"));
                }
            }
        }
        self.lexer.set_mode(Mode::Normal);
        self.unique += 1;
        let expanded = self.expand_body(&body, &args, self.unique);
        let saved = self.syms.scope().map(|s| s.to_string());
        let file = format!("{}::{name}", self.lexer.file());
        self.lexer.push_context(
            file,
            SourceBuffer::from_str(&expanded),
            Some(MacroArgs {
                args,
                unique: self.unique,
            }),
        );
        self.scope_stack.push((self.lexer.depth(), saved));
        self.next()
    }

    /// Expand `\1`..`\9` and `\@` textually before a macro body is re-lexed,
    /// so an expansion can glue onto surrounding identifier characters.
    /// Other escapes pass through untouched for the string scanner.
    fn expand_body(&mut self, body: &str, args: &[String], unique: u32) -> String {
        let bytes = body.as_bytes();
        let mut out = String::with_capacity(body.len());
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if c == b'\\' && i + 1 < bytes.len() {
                let n = bytes[i + 1];
                i += 2;
                match n {
                    b'1'..=b'9' => match args.get((n - b'0') as usize - 1) {
                        Some(text) => out.push_str(text),
                        None => self.diag.error(format_args!(
                            "{}:{}: macro argument \\{} not defined",
                            self.lexer.file(),
                            self.lexer.line(),
                            n as char
                        )),
                    },
                    b'@' => out.push_str(&format!("_{unique}")),
                    _ => {
                        out.push('\\');
                        out.push(n as char);
                    }
                }
                continue;
            }
            out.push(c as char);
            i += 1;
        }
        out
    }

    // ---- expressions ----

    fn const_expr(&mut self) -> io::Result<i32> {
        match self.expr()? {
            Expr::Known(v) => Ok(v),
            Expr::Unknown(e) => {
                self.diag.error(format_args!(
                    "{}:{}: expression must be constant: {}",
                    self.lexer.file(),
                    self.lexer.line(),
                    e.reason
                ));
                Ok(0)
            }
        }
    }

    fn expr(&mut self) -> io::Result<Expr> {
        self.expr_bp(0)
    }

    fn binop(kind: u32) -> Option<(BinaryOp, u8)> {
        match kind {
            tok::LOGOR => Some((BinaryOp::LogOr, 1)),
            tok::LOGAND => Some((BinaryOp::LogAnd, 2)),
            tok::EQ => Some((BinaryOp::Eq, 3)),
            tok::NE => Some((BinaryOp::Ne, 3)),
            tok::GT => Some((BinaryOp::Gt, 3)),
            tok::LT => Some((BinaryOp::Lt, 3)),
            tok::GE => Some((BinaryOp::Ge, 3)),
            tok::LE => Some((BinaryOp::Le, 3)),
            tok::PLUS => Some((BinaryOp::Add, 4)),
            tok::MINUS => Some((BinaryOp::Sub, 4)),
            tok::AMP => Some((BinaryOp::And, 5)),
            tok::PIPE => Some((BinaryOp::Or, 5)),
            tok::CARET => Some((BinaryOp::Xor, 5)),
            tok::SHL => Some((BinaryOp::Shl, 6)),
            tok::SHR => Some((BinaryOp::Shr, 6)),
            tok::STAR => Some((BinaryOp::Mul, 7)),
            tok::SLASH => Some((BinaryOp::Div, 7)),
            tok::PERCENT => Some((BinaryOp::Mod, 7)),
            tok::EXP => Some((BinaryOp::Exp, 8)),
            _ => None,
        }
    }

    fn expr_bp(&mut self, min: u8) -> io::Result<Expr> {
        let mut lhs = self.unary_expr()?;
        while let Some((op, prec)) = Self::binop(self.tok.kind) {
            if prec < min {
                break;
            }
            self.next()?;
            let rhs = self.expr_bp(prec + 1)?;
            let result = Expr::binary(op, lhs, rhs, &self.syms, &eval_ctx!(self), &mut self.diag);
            lhs = self.check_expr(result)?;
        }
        Ok(lhs)
    }

    fn check_expr(&mut self, result: DiagResult<Expr>) -> io::Result<Expr> {
        match result {
            Ok(e) => Ok(e),
            Err(Diag::Error(msg)) => {
                self.diag.error(format_args!(
                    "{}:{}: {msg}",
                    self.lexer.file(),
                    self.lexer.line()
                ));
                Ok(Expr::Known(0))
            }
            Err(e @ Diag::Fatal(_)) => Err(self.err(e.message())),
        }
    }

    fn unary_expr(&mut self) -> io::Result<Expr> {
        match self.tok.kind {
            tok::MINUS => {
                self.next()?;
                let e = self.unary_expr()?;
                let result = e.negate();
                self.check_expr(result)
            }
            tok::TILDE => {
                self.next()?;
                let e = self.unary_expr()?;
                let result = e.complement();
                self.check_expr(result)
            }
            tok::BANG => {
                self.next()?;
                let e = self.unary_expr()?;
                let result = e.log_not();
                self.check_expr(result)
            }
            tok::PLUS => {
                self.next()?;
                self.unary_expr()
            }
            _ => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> io::Result<Expr> {
        match self.tok.kind {
            tok::NUMBER => {
                let value = self.tok.num();
                self.next()?;
                Ok(Expr::number(value))
            }
            tok::ID => {
                let name = self.tok.text().to_string();
                self.next()?;
                let result =
                    Expr::symbol(&name, &mut self.syms, &eval_ctx!(self), &mut self.diag);
                self.check_expr(result)
            }
            tok::LPAREN => {
                self.next()?;
                let e = self.expr()?;
                self.expect(tok::RPAREN, "`)`")?;
                Ok(e)
            }
            tok::COLON => {
                // Anonymous label reference, `:+` / `:--` and so on.
                self.next()?;
                let neg = match self.tok.kind {
                    tok::PLUS => false,
                    tok::MINUS => true,
                    _ => return Err(self.err("expected `+` or `-`")),
                };
                let sign = self.tok.kind;
                let mut count = 0u32;
                while self.tok.kind == sign {
                    count += 1;
                    self.next()?;
                }
                let result = self.syms.anon_label_name(count, neg);
                let name = self.check(result)?;
                if name.is_empty() {
                    return Ok(Expr::Known(0));
                }
                let result =
                    Expr::symbol(&name, &mut self.syms, &eval_ctx!(self), &mut self.diag);
                self.check_expr(result)
            }
            tok::HIGH => {
                self.next()?;
                self.expect(tok::LPAREN, "`(`")?;
                let e = self.expr()?;
                self.expect(tok::RPAREN, "`)`")?;
                let result = e.high(&self.syms, &eval_ctx!(self), &mut self.diag);
                self.check_expr(result)
            }
            tok::LOW => {
                self.next()?;
                self.expect(tok::LPAREN, "`(`")?;
                let e = self.expr()?;
                self.expect(tok::RPAREN, "`)`")?;
                let result = e.low(&self.syms, &eval_ctx!(self), &mut self.diag);
                self.check_expr(result)
            }
            tok::ISCONST => {
                self.next()?;
                self.expect(tok::LPAREN, "`(`")?;
                let e = self.expr()?;
                self.expect(tok::RPAREN, "`)`")?;
                Ok(e.is_const())
            }
            tok::BANK => {
                self.next()?;
                self.expect(tok::LPAREN, "`(`")?;
                let e = match self.tok.kind {
                    lexer::STRING => {
                        let name = self.tok.text().to_string();
                        self.next()?;
                        let result = Expr::bank_section(&name, &eval_ctx!(self));
                        self.check_expr(result)?
                    }
                    tok::ID if self.tok.text() == "@" => {
                        self.next()?;
                        let result = Expr::bank_self(&eval_ctx!(self), &mut self.diag);
                        self.check_expr(result)?
                    }
                    tok::ID => {
                        let name = self.tok.text().to_string();
                        self.next()?;
                        let result = Expr::bank_symbol(
                            &name,
                            &mut self.syms,
                            &eval_ctx!(self),
                            &mut self.diag,
                        );
                        self.check_expr(result)?
                    }
                    _ => return Err(self.err("expected symbol or section name")),
                };
                self.expect(tok::RPAREN, "`)`")?;
                Ok(e)
            }
            tok::DEF => {
                self.next()?;
                self.expect(tok::LPAREN, "`(`")?;
                self.no_expand = true;
                if self.tok.kind != tok::ID {
                    self.no_expand = false;
                    return Err(self.err("expected symbol name"));
                }
                let name = self.tok.text().to_string();
                self.next()?;
                self.no_expand = false;
                self.expect(tok::RPAREN, "`)`")?;
                let defined = match self.check(self.syms.find_scoped(&name).map(|s| s.cloned()))? {
                    Some(sym) => sym.is_defined(),
                    None => false,
                };
                Ok(Expr::Known(defined as i32))
            }
            _ => Err(self.err("expected expression")),
        }
    }

    // ---- emission ----

    fn pc_offset(&self) -> u32 {
        match self.current_section {
            Some(idx) => self.sections[idx].pc_offset(),
            None => 0,
        }
    }

    fn sect(&mut self) -> io::Result<usize> {
        match self.current_section {
            Some(idx) => Ok(idx),
            None => Err(self.err("code generation before SECTION directive")),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let idx = self.sect()?;
        self.sections[idx].data.extend_from_slice(bytes);
        Ok(())
    }

    fn add_patch(&mut self, kind: PatchKind, e: &UnknownExpr) -> io::Result<()> {
        let idx = self.sect()?;
        let offset = self.sections[idx].data.len() as u32;
        let result = Patch::new(
            self.lexer.file(),
            self.lexer.line(),
            kind,
            offset,
            idx,
            offset,
            e,
            &mut self.syms,
        );
        let patch = match result {
            Ok(patch) => patch,
            Err(e) => return Err(self.err(e.message())),
        };
        self.sections[idx].patches.push(patch);
        self.sections[idx].data.extend_from_slice(&[0; 4][..kind.size()]);
        Ok(())
    }

    fn emit_byte_expr(&mut self, e: Expr) -> io::Result<()> {
        match e {
            Expr::Known(v) => self.emit(&[v as u8]),
            Expr::Unknown(e) => self.add_patch(PatchKind::Byte, &e),
        }
    }

    fn emit_word_expr(&mut self, e: Expr) -> io::Result<()> {
        match e {
            Expr::Known(v) => self.emit(&(v as u16).to_le_bytes()),
            Expr::Unknown(e) => self.add_patch(PatchKind::Word, &e),
        }
    }

    fn emit_jr_expr(&mut self, e: Expr) -> io::Result<()> {
        match e {
            Expr::Known(v) => {
                let after = eval_ctx!(self).pc().wrapping_add(1);
                let disp = v.wrapping_sub(after);
                if !(-128..=127).contains(&disp) {
                    self.diag.error(format_args!(
                        "{}:{}: jr target out of reach (displacement {disp})",
                        self.lexer.file(),
                        self.lexer.line()
                    ));
                }
                self.emit(&[disp as u8])
            }
            Expr::Unknown(e) => self.add_patch(PatchKind::JrByte, &e),
        }
    }

    // ---- instructions ----

    fn r8_code(&mut self) -> io::Result<Option<u8>> {
        let code = match self.tok.kind {
            tok::B => 0,
            tok::C => 1,
            tok::D => 2,
            tok::E => 3,
            tok::H => 4,
            tok::L => 5,
            tok::A => 7,
            tok::LPAREN if self.peek_is_hl() => {
                self.next()?; // (
                self.next()?; // HL
                self.expect(tok::RPAREN, "`)`")?;
                return Ok(Some(6));
            }
            _ => return Ok(None),
        };
        self.next()?;
        Ok(Some(code))
    }

    /// Whether the lookahead parenthesis opens `(HL)`. The `(` token has
    /// already been lexed, so the unconsumed buffer starts right after it.
    fn peek_is_hl(&self) -> bool {
        let Some(text) = self.lexer.peek_str(8) else {
            return false;
        };
        let compact: String = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        compact.starts_with("HL)")
    }

    fn cond_code(&self) -> Option<u8> {
        match self.tok.kind {
            tok::NZ => Some(0),
            tok::Z => Some(1),
            tok::NC => Some(2),
            tok::C => Some(3),
            _ => None,
        }
    }

    fn instruction(&mut self, kind: u32) -> io::Result<()> {
        match kind {
            tok::NOP => self.simple(&[0x00]),
            tok::HALT => self.simple(&[0x76]),
            tok::STOP => self.simple(&[0x10, 0x00]),
            tok::DI => self.simple(&[0xF3]),
            tok::EI => self.simple(&[0xFB]),
            tok::RETI => self.simple(&[0xD9]),
            tok::CPL => self.simple(&[0x2F]),
            tok::SCF => self.simple(&[0x37]),
            tok::CCF => self.simple(&[0x3F]),
            tok::DAA => self.simple(&[0x27]),
            tok::RET => {
                self.next()?;
                match self.cond_code() {
                    Some(cc) => {
                        self.next()?;
                        self.emit(&[0xC0 | cc << 3])
                    }
                    None => self.emit(&[0xC9]),
                }
            }
            tok::RST => {
                self.next()?;
                let e = self.expr()?;
                let result = e.check_rst(&eval_ctx!(self), &mut self.diag);
                let e = self.check_expr(result)?;
                self.emit_byte_expr(e)
            }
            tok::ADD => self.alu(0x80, 0xC6, true),
            tok::ADC => self.alu(0x88, 0xCE, false),
            tok::SUB => self.alu(0x90, 0xD6, false),
            tok::SBC => self.alu(0x98, 0xDE, false),
            tok::AND => self.alu(0xA0, 0xE6, false),
            tok::XOR => self.alu(0xA8, 0xEE, false),
            tok::OR => self.alu(0xB0, 0xF6, false),
            tok::CP => self.alu(0xB8, 0xFE, false),
            tok::INC => self.inc_dec(0x04, 0x03),
            tok::DEC => self.inc_dec(0x05, 0x0B),
            tok::LD => self.load(),
            tok::LDH => self.load_high(),
            tok::JP => self.jump(),
            tok::JR => self.jump_relative(),
            tok::CALL => self.call(),
            tok::PUSH => self.push_pop(0xC5),
            tok::POP => self.push_pop(0xC1),
            _ => Err(self.err("unexpected token")),
        }
    }

    fn simple(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.next()?;
        self.emit(bytes)
    }

    /// 8-bit ALU group. `ADD HL, rr` hangs off the same mnemonic.
    fn alu(&mut self, reg_base: u8, imm_op: u8, allow_hl: bool) -> io::Result<()> {
        self.next()?;
        if allow_hl && self.tok.kind == tok::HL {
            self.next()?;
            self.expect(tok::COMMA, "`,`")?;
            let rr = match self.tok.kind {
                tok::BC => 0,
                tok::DE => 1,
                tok::HL => 2,
                tok::SP => 3,
                _ => return Err(self.err("expected 16-bit register")),
            };
            self.next()?;
            return self.emit(&[0x09 | rr << 4]);
        }
        if self.tok.kind == tok::A {
            self.next()?;
            if !self.eat_if(tok::COMMA)? {
                // `SUB A` style: the accumulator was the operand itself.
                return self.emit(&[reg_base | 7]);
            }
        }
        if let Some(code) = self.r8_code()? {
            return self.emit(&[reg_base | code]);
        }
        let e = self.expr()?;
        self.emit(&[imm_op])?;
        self.emit_byte_expr(e)
    }

    fn inc_dec(&mut self, r8_base: u8, r16_base: u8) -> io::Result<()> {
        self.next()?;
        match self.tok.kind {
            tok::BC => {
                self.next()?;
                self.emit(&[r16_base])
            }
            tok::DE => {
                self.next()?;
                self.emit(&[r16_base | 0x10])
            }
            tok::HL => {
                self.next()?;
                self.emit(&[r16_base | 0x20])
            }
            tok::SP => {
                self.next()?;
                self.emit(&[r16_base | 0x30])
            }
            _ => match self.r8_code()? {
                Some(code) => self.emit(&[r8_base | code << 3]),
                None => Err(self.err("expected register")),
            },
        }
    }

    fn load(&mut self) -> io::Result<()> {
        self.next()?;
        match self.tok.kind {
            tok::LPAREN if !self.peek_is_hl() => self.load_indirect_dst(),
            tok::BC | tok::DE | tok::HL | tok::SP => self.load_r16(),
            _ => {
                let Some(dst) = self.r8_code()? else {
                    return Err(self.err("expected register"));
                };
                self.expect(tok::COMMA, "`,`")?;
                if self.tok.kind == tok::LPAREN && !self.peek_is_hl() {
                    // `LD A, (BC/DE/nn)`
                    if dst != 7 {
                        return Err(self.err("only `a` loads from memory"));
                    }
                    self.next()?;
                    match self.tok.kind {
                        tok::BC => {
                            self.next()?;
                            self.expect(tok::RPAREN, "`)`")?;
                            self.emit(&[0x0A])
                        }
                        tok::DE => {
                            self.next()?;
                            self.expect(tok::RPAREN, "`)`")?;
                            self.emit(&[0x1A])
                        }
                        _ => {
                            let e = self.expr()?;
                            self.expect(tok::RPAREN, "`)`")?;
                            self.emit(&[0xFA])?;
                            self.emit_word_expr(e)
                        }
                    }
                } else if let Some(src) = self.r8_code()? {
                    if dst == 6 && src == 6 {
                        return Err(self.err("invalid operand combination"));
                    }
                    self.emit(&[0x40 | dst << 3 | src])
                } else {
                    let e = self.expr()?;
                    self.emit(&[0x06 | dst << 3])?;
                    self.emit_byte_expr(e)
                }
            }
        }
    }

    fn load_indirect_dst(&mut self) -> io::Result<()> {
        self.next()?; // (
        match self.tok.kind {
            tok::BC => {
                self.next()?;
                self.expect(tok::RPAREN, "`)`")?;
                self.expect(tok::COMMA, "`,`")?;
                self.expect(tok::A, "`a`")?;
                self.emit(&[0x02])
            }
            tok::DE => {
                self.next()?;
                self.expect(tok::RPAREN, "`)`")?;
                self.expect(tok::COMMA, "`,`")?;
                self.expect(tok::A, "`a`")?;
                self.emit(&[0x12])
            }
            _ => {
                let e = self.expr()?;
                self.expect(tok::RPAREN, "`)`")?;
                self.expect(tok::COMMA, "`,`")?;
                self.expect(tok::A, "`a`")?;
                self.emit(&[0xEA])?;
                self.emit_word_expr(e)
            }
        }
    }

    fn load_r16(&mut self) -> io::Result<()> {
        let rr = match self.tok.kind {
            tok::BC => 0,
            tok::DE => 1,
            tok::HL => 2,
            _ => 3,
        };
        let is_sp = self.tok.kind == tok::SP;
        self.next()?;
        self.expect(tok::COMMA, "`,`")?;
        if is_sp && self.tok.kind == tok::HL {
            self.next()?;
            return self.emit(&[0xF9]);
        }
        let e = self.expr()?;
        self.emit(&[0x01 | rr << 4])?;
        self.emit_word_expr(e)
    }

    fn load_high(&mut self) -> io::Result<()> {
        self.next()?;
        if self.tok.kind == tok::A {
            self.next()?;
            self.expect(tok::COMMA, "`,`")?;
            self.expect(tok::LPAREN, "`(`")?;
            let e = self.expr()?;
            self.expect(tok::RPAREN, "`)`")?;
            let result = e.check_hram(&eval_ctx!(self), &mut self.diag);
            let e = self.check_expr(result)?;
            self.emit(&[0xF0])?;
            return self.emit_byte_expr(e);
        }
        self.expect(tok::LPAREN, "`(`")?;
        let e = self.expr()?;
        self.expect(tok::RPAREN, "`)`")?;
        self.expect(tok::COMMA, "`,`")?;
        self.expect(tok::A, "`a`")?;
        let result = e.check_hram(&eval_ctx!(self), &mut self.diag);
        let e = self.check_expr(result)?;
        self.emit(&[0xE0])?;
        self.emit_byte_expr(e)
    }

    fn jump(&mut self) -> io::Result<()> {
        self.next()?;
        if self.tok.kind == tok::HL {
            self.next()?;
            return self.emit(&[0xE9]);
        }
        if let Some(cc) = self.cond_code() {
            self.next()?;
            self.expect(tok::COMMA, "`,`")?;
            let e = self.expr()?;
            self.emit(&[0xC2 | cc << 3])?;
            return self.emit_word_expr(e);
        }
        let e = self.expr()?;
        self.emit(&[0xC3])?;
        self.emit_word_expr(e)
    }

    fn jump_relative(&mut self) -> io::Result<()> {
        self.next()?;
        if let Some(cc) = self.cond_code() {
            self.next()?;
            self.expect(tok::COMMA, "`,`")?;
            let e = self.expr()?;
            self.emit(&[0x20 | cc << 3])?;
            return self.emit_jr_expr(e);
        }
        let e = self.expr()?;
        self.emit(&[0x18])?;
        self.emit_jr_expr(e)
    }

    fn call(&mut self) -> io::Result<()> {
        self.next()?;
        if let Some(cc) = self.cond_code() {
            self.next()?;
            self.expect(tok::COMMA, "`,`")?;
            let e = self.expr()?;
            self.emit(&[0xC4 | cc << 3])?;
            return self.emit_word_expr(e);
        }
        let e = self.expr()?;
        self.emit(&[0xCD])?;
        self.emit_word_expr(e)
    }

    fn push_pop(&mut self, base: u8) -> io::Result<()> {
        self.next()?;
        let rr = match self.tok.kind {
            tok::BC => 0,
            tok::DE => 1,
            tok::HL => 2,
            tok::AF => 3,
            _ => return Err(self.err("expected 16-bit register")),
        };
        self.next()?;
        self.emit(&[base | rr << 4])
    }
}

// ---- object writing ----

fn write_u32(out: &mut dyn Write, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_i32(out: &mut dyn Write, value: i32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

fn write_str(out: &mut dyn Write, s: &str) -> io::Result<()> {
    write_u32(out, s.len() as u32)?;
    out.write_all(s.as_bytes())
}

fn write_object(asm: &mut Asm, out: &mut dyn Write) -> io::Result<()> {
    out.write_all("gbasm01".as_bytes())?;

    // Exported symbols join the ID table even when no local patch used them.
    let exported: Vec<String> = asm
        .syms
        .iter()
        .filter(|sym| sym.exported && sym.is_defined() && !sym.builtin && sym.is_numeric())
        .map(|sym| sym.name.clone())
        .collect();
    for name in &exported {
        asm.syms
            .register_for_output(name)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.message().to_string()))?;
    }

    let registry: Vec<String> = asm.syms.registry().to_vec();
    write_u32(out, registry.len() as u32)?;
    for name in &registry {
        let sym = asm
            .syms
            .find(name)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "missing registered symbol"))?;
        write_str(out, name)?;
        // Computed builtins travel as imports; the linker resolves them.
        let import = !sym.is_defined()
            || sym.builtin
            || !matches!(sym.value, gbasm::symbol::SymbolValue::Stored(_));
        if import {
            out.write_all(&[0])?;
            continue;
        }
        out.write_all(&[if sym.exported { 2 } else { 1 }])?;
        write_str(out, &sym.file)?;
        write_u32(out, sym.line)?;
        match sym.section {
            Some(idx) => write_i32(out, idx as i32)?,
            None => write_i32(out, -1)?,
        }
        match sym.value {
            gbasm::symbol::SymbolValue::Stored(v) => write_i32(out, v)?,
            gbasm::symbol::SymbolValue::Computed(_) => write_i32(out, 0)?,
        }
    }

    write_u32(out, asm.sections.len() as u32)?;
    for section in &asm.sections {
        write_str(out, &section.name)?;
        match section.org {
            Some(org) => write_i32(out, org as i32)?,
            None => write_i32(out, -1)?,
        }
        match section.bank {
            Some(bank) => write_i32(out, bank as i32)?,
            None => write_i32(out, -1)?,
        }
        write_u32(out, section.data.len() as u32)?;
        out.write_all(&section.data)?;
        write_u32(out, section.patches.len() as u32)?;
        for patch in &section.patches {
            write_patch(out, patch)?;
        }
    }

    write_u32(out, asm.assertions.len() as u32)?;
    for assertion in &asm.assertions {
        write_patch(out, &assertion.patch)?;
        out.write_all(&[assertion.kind.to_u8()])?;
        write_str(out, &assertion.message)?;
    }
    Ok(())
}

fn write_patch(out: &mut dyn Write, patch: &Patch) -> io::Result<()> {
    write_str(out, &patch.file)?;
    write_u32(out, patch.line)?;
    write_u32(out, patch.offset)?;
    out.write_all(&[patch.kind.to_u8()])?;
    write_u32(out, patch.pc_section as u32)?;
    write_u32(out, patch.pc_offset)?;
    write_u32(out, patch.rpn.len() as u32)?;
    out.write_all(&patch.rpn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbasm::patch::{apply_patches, LinkSymbol, RpnStack};

    fn assemble(src: &str) -> (Vec<Section>, SymbolTable, Vec<Assertion>, usize) {
        let rules = rules();
        let mut asm = Asm::new(&rules, "test.asm".into(), SourceBuffer::from_str(src), vec![]);
        asm.pass().unwrap();
        let errors = asm.diag.error_count();
        (asm.sections, asm.syms, asm.assertions, errors)
    }

    /// Resolve everything in-process the way the linker would.
    fn link(sections: &mut [Section], syms: &SymbolTable) -> usize {
        let symbols: Vec<LinkSymbol> = syms
            .registry()
            .iter()
            .map(|name| {
                let sym = syms.find(name).unwrap();
                LinkSymbol {
                    name: name.clone(),
                    value: match sym.value {
                        gbasm::symbol::SymbolValue::Stored(v) => v,
                        gbasm::symbol::SymbolValue::Computed(_) => 0,
                    },
                    section: sym.section,
                    defined: sym.is_defined() && !sym.builtin,
                }
            })
            .collect();
        let mut stack = RpnStack::new();
        let mut diag = Diagnostics::new();
        apply_patches(sections, &symbols, &mut stack, &mut diag).unwrap();
        diag.error_count()
    }

    #[test]
    fn known_immediates_assemble_directly() {
        let (sections, _, _, errors) = assemble(
            "SECTION \"code\", ORG $0150\nFoo: ADD A, 1\n  xor a\n  ld b, $7F\n  nop\n",
        );
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0xC6, 0x01, 0xAF, 0x06, 0x7F, 0x00]);
        assert!(sections[0].patches.is_empty());
    }

    #[test]
    fn backward_jr_in_floating_section_folds_at_link() {
        let src = "SECTION \"code\"\nMain:\n.loop: jr .loop\n";
        let (mut sections, syms, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        // The local label lives in a floating section, so the displacement
        // waits for the linker even though it is section-relative.
        assert_eq!(sections[0].patches.len(), 1);
        assert_eq!(link(&mut sections, &syms), 0);
        assert_eq!(sections[0].data, vec![0x18, 0xFE]);
    }

    #[test]
    fn backward_jr_in_fixed_section_folds_immediately() {
        let src = "SECTION \"code\", ORG $0150\nMain:\n  jr Main\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0x18, 0xFE]);
        assert!(sections[0].patches.is_empty());
    }

    #[test]
    fn forward_reference_becomes_word_patch() {
        let src = "SECTION \"code\", ORG $0150\n  call Later\nLater: ret\n";
        let (mut sections, syms, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].patches.len(), 1);
        assert_eq!(link(&mut sections, &syms), 0);
        // `Later` sits at $0150 + 3.
        assert_eq!(sections[0].data, vec![0xCD, 0x53, 0x01, 0xC9]);
    }

    #[test]
    fn equ_set_and_purge() {
        let src = "K EQU 5\nV SET 1\nV SET K + 1\nSECTION \"d\"\n  db V\nPURGE K\n  db DEF(K)\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![6, 0]);
    }

    #[test]
    fn db_strings_and_exprs() {
        let src = "SECTION \"d\"\n  db \"AB\", 1, 2\n  dw $1234\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0x41, 0x42, 1, 2, 0x34, 0x12]);
    }

    #[test]
    fn ds_fills() {
        let (sections, _, _, errors) = assemble("SECTION \"d\"\n  ds 3, $AA\n");
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn ldh_narrows_known_addresses() {
        let src = "SECTION \"c\"\n  ldh a, ($FF40)\n  ldh ($80), a\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0xF0, 0x40, 0xE0, 0x80]);
    }

    #[test]
    fn rst_validates_vector() {
        let (sections, _, _, errors) = assemble("SECTION \"c\"\n  rst $18\n  rst $09\n");
        assert_eq!(errors, 1);
        assert_eq!(sections[0].data, vec![0xDF, 0x09 | 0xC7]);
    }

    #[test]
    fn if_else_endc() {
        let src = "K EQU 1\nSECTION \"c\"\nIF K\n  db 1\nELSE\n  db 2\nENDC\nIF !K\n  db 3\nELSE\n  db 4\nENDC\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![1, 4]);
    }

    #[test]
    fn rept_repeats_body() {
        let src = "SECTION \"c\"\nREPT 3\n  db 7\nENDR\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![7, 7, 7]);
    }

    #[test]
    fn macros_expand_with_args() {
        let src = "\
Pair: MACRO
  db \\1, \\2, _NARG
ENDM
SECTION \"c\"
  Pair 1, 2
  Pair 3, 4
";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![1, 2, 2, 3, 4, 2]);
    }

    #[test]
    fn macro_unique_labels() {
        let src = "\
Spin: MACRO
loop\\@:
  jr loop\\@
ENDM
SECTION \"c\", ORG 0
  Spin
  Spin
";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0x18, 0xFE, 0x18, 0xFE]);
    }

    #[test]
    fn string_equates_splice_into_stream() {
        let src = "Reg EQUS \"$FF40\"\nSECTION \"c\"\n  ldh a, (Reg)\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0xF0, 0x40]);
    }

    #[test]
    fn anonymous_labels() {
        let src = "SECTION \"c\", ORG 0\n:\n  jr :-\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0x18, 0xFE]);
    }

    #[test]
    fn assert_known_and_deferred() {
        let src = "SECTION \"c\"\nStart:\nASSERT 1 + 1 == 2\nASSERT Start >= 0, \"start\"\n";
        let (_, _, assertions, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(assertions.len(), 1);
        assert_eq!(assertions[0].message, "start");
    }

    #[test]
    fn deferred_assert_without_section_carries_no_pc() {
        let src = "ASSERT Ext == 1, \"ext\"\n";
        let (_, _, assertions, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(assertions.len(), 1);
        assert_eq!(assertions[0].patch.pc_section, gbasm::patch::NO_PC_SECTION);
    }

    #[test]
    fn high_low_operators() {
        let src = "SECTION \"c\"\n  db HIGH($1234), LOW($1234)\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![0x12, 0x34]);
    }

    #[test]
    fn bank_of_fixed_section_folds() {
        let src = "SECTION \"c\", ORG $4000, BANK 2\nHere:\n  db BANK(@), BANK(Here), BANK(\"c\")\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(sections[0].data, vec![2, 2, 2]);
    }

    #[test]
    fn code_outside_section_is_fatal() {
        let rules = rules();
        let mut asm = Asm::new(
            &rules,
            "test.asm".into(),
            SourceBuffer::from_str("  nop\n"),
            vec![],
        );
        assert!(asm.pass().is_err());
    }

    #[test]
    fn label_collision_is_reported_not_fatal() {
        let src = "SECTION \"c\"\nFoo:\nFoo:\n  nop\n";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 1);
        assert_eq!(sections[0].data, vec![0x00]);
    }

    #[test]
    fn registers_and_jumps_encode() {
        let src = "\
SECTION \"c\", ORG 0
Start:
  ld hl, $8000
  ld (hl), a
  ld a, (hl)
  ld b, c
  inc de
  dec a
  push af
  pop bc
  jp nz, Start
  jp hl
  ret z
  call Start
";
        let (sections, _, _, errors) = assemble(src);
        assert_eq!(errors, 0);
        assert_eq!(
            sections[0].data,
            vec![
                0x21, 0x00, 0x80, // ld hl, $8000
                0x77, // ld (hl), a
                0x7E, // ld a, (hl)
                0x41, // ld b, c
                0x13, // inc de
                0x3D, // dec a
                0xF5, // push af
                0xC1, // pop bc
                0xC2, 0x00, 0x00, // jp nz, Start
                0xE9, // jp hl
                0xC8, // ret z
                0xCD, 0x00, 0x00, // call Start
            ]
        );
    }
}
