use crate::{
    diag::{Diag, DiagResult, Diagnostics},
    expr::{asl, asr, UnknownExpr},
    symbol::SymbolTable,
    Section,
};

// Pattern-matchable aliases of the wire opcodes.
#[rustfmt::skip]
mod op {
    use crate::expr::RpnOp;
    pub const ADD: u8       = RpnOp::ADD;
    pub const SUB: u8       = RpnOp::SUB;
    pub const MUL: u8       = RpnOp::MUL;
    pub const DIV: u8       = RpnOp::DIV;
    pub const MOD: u8       = RpnOp::MOD;
    pub const UNSUB: u8     = RpnOp::UNSUB;
    pub const OR: u8        = RpnOp::OR;
    pub const AND: u8       = RpnOp::AND;
    pub const XOR: u8       = RpnOp::XOR;
    pub const UNNOT: u8     = RpnOp::UNNOT;
    pub const LOGAND: u8    = RpnOp::LOGAND;
    pub const LOGOR: u8     = RpnOp::LOGOR;
    pub const LOGUNNOT: u8  = RpnOp::LOGUNNOT;
    pub const LOGEQ: u8     = RpnOp::LOGEQ;
    pub const LOGNE: u8     = RpnOp::LOGNE;
    pub const LOGGT: u8     = RpnOp::LOGGT;
    pub const LOGLT: u8     = RpnOp::LOGLT;
    pub const LOGGE: u8     = RpnOp::LOGGE;
    pub const LOGLE: u8     = RpnOp::LOGLE;
    pub const SHL: u8       = RpnOp::SHL;
    pub const SHR: u8       = RpnOp::SHR;
    pub const BANK_SYM: u8  = RpnOp::BANK_SYM;
    pub const BANK_SECT: u8 = RpnOp::BANK_SECT;
    pub const BANK_SELF: u8 = RpnOp::BANK_SELF;
    pub const HRAM: u8      = RpnOp::HRAM;
    pub const RST: u8       = RpnOp::RST;
    pub const CONST: u8     = RpnOp::CONST;
    pub const SYM: u8       = RpnOp::SYM;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Byte,
    Word,
    Long,
    /// One byte holding a `jr` displacement relative to the byte after it.
    JrByte,
}

impl PatchKind {
    pub fn to_u8(self) -> u8 {
        match self {
            PatchKind::Byte => 0,
            PatchKind::Word => 1,
            PatchKind::Long => 2,
            PatchKind::JrByte => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PatchKind::Byte),
            1 => Some(PatchKind::Word),
            2 => Some(PatchKind::Long),
            3 => Some(PatchKind::JrByte),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            PatchKind::Byte | PatchKind::JrByte => 1,
            PatchKind::Word => 2,
            PatchKind::Long => 4,
        }
    }
}

/// `pc_section` of a patch created outside any section, such as a deferred
/// top-level assertion. Serializes as `u32::MAX`.
pub const NO_PC_SECTION: usize = u32::MAX as usize;

/// A deferred value: where to write it, how wide, the PC context it was
/// emitted under, and the RPN program that computes it. In this encoding
/// `SYM`/`BANK_SYM` carry 4-byte LE symbol IDs.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub file: String,
    pub line: u32,
    pub offset: u32,
    pub kind: PatchKind,
    pub pc_section: usize,
    pub pc_offset: u32,
    pub rpn: Vec<u8>,
}

impl Patch {
    /// Freeze an unresolved expression into a patch, swapping inline symbol
    /// names for output-table IDs (assigned on first use, which is what
    /// protects a symbol from being purged).
    pub fn new(
        file: &str,
        line: u32,
        kind: PatchKind,
        offset: u32,
        pc_section: usize,
        pc_offset: u32,
        expr: &UnknownExpr,
        syms: &mut SymbolTable,
    ) -> DiagResult<Patch> {
        let mut rpn = Vec::with_capacity(expr.patch_size);
        let mut i = 0;
        while i < expr.rpn.len() {
            let opcode = expr.rpn[i];
            i += 1;
            rpn.push(opcode);
            match opcode {
                op::CONST => {
                    let bytes = expr
                        .rpn
                        .get(i..i + 4)
                        .ok_or_else(|| Diag::fatal("truncated RPN expression"))?;
                    rpn.extend_from_slice(bytes);
                    i += 4;
                }
                op::SYM | op::BANK_SYM => {
                    let name = read_name(&expr.rpn, &mut i)?;
                    let id = syms.register_for_output(&name)?;
                    rpn.extend_from_slice(&id.to_le_bytes());
                }
                op::BANK_SECT => {
                    let name = read_name(&expr.rpn, &mut i)?;
                    rpn.extend_from_slice(name.as_bytes());
                    rpn.push(0);
                }
                _ => {}
            }
        }
        Ok(Patch {
            file: file.to_string(),
            line,
            offset,
            kind,
            pc_section,
            pc_offset,
            rpn,
        })
    }

    /// Address of the byte after this patch's operand, the base `jr`
    /// displacements are relative to.
    fn pc_after(&self, sections: &[Section]) -> i32 {
        let org = sections[self.pc_section].org.unwrap_or(0);
        org.wrapping_add(self.pc_offset).wrapping_add(1) as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertKind {
    Warn,
    Error,
    Fatal,
}

impl AssertKind {
    pub fn to_u8(self) -> u8 {
        match self {
            AssertKind::Warn => 0,
            AssertKind::Error => 1,
            AssertKind::Fatal => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AssertKind::Warn),
            1 => Some(AssertKind::Error),
            2 => Some(AssertKind::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assertion {
    pub patch: Patch,
    pub kind: AssertKind,
    pub message: String,
}

/// A symbol as the linker sees it: values of labels are still offsets into
/// their (now placed) sections.
#[derive(Debug, Clone)]
pub struct LinkSymbol {
    pub name: String,
    pub value: i32,
    pub section: Option<usize>,
    pub defined: bool,
}

impl LinkSymbol {
    pub fn address(&self, sections: &[Section]) -> i32 {
        match self.section {
            Some(idx) => sections[idx]
                .org
                .unwrap_or(0)
                .wrapping_add(self.value as u32) as i32,
            None => self.value,
        }
    }
}

/// Value stack of the evaluator. One instance is reused (cleared, not
/// reallocated) across every assertion and patch of a link run.
#[derive(Debug, Default)]
pub struct RpnStack {
    values: Vec<i32>,
}

impl RpnStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn push(&mut self, value: i32) {
        self.values.push(value);
    }

    fn pop(&mut self) -> DiagResult<i32> {
        self.values
            .pop()
            .ok_or_else(|| Diag::fatal("RPN stack underflow"))
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

fn read_u32(rpn: &[u8], i: &mut usize) -> DiagResult<u32> {
    let bytes = rpn
        .get(*i..*i + 4)
        .ok_or_else(|| Diag::fatal("truncated RPN expression"))?;
    *i += 4;
    let mut le = [0u8; 4];
    le.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(le))
}

fn read_name(rpn: &[u8], i: &mut usize) -> DiagResult<String> {
    let start = *i;
    while *i < rpn.len() && rpn[*i] != 0 {
        *i += 1;
    }
    if *i == rpn.len() {
        return Err(Diag::fatal("truncated RPN expression"));
    }
    let name = String::from_utf8_lossy(&rpn[start..*i]).into_owned();
    *i += 1;
    Ok(name)
}

/// Rewrite the symbol IDs of a patch program through `map` (object-local ID
/// to global symbol index), done once when an object file is loaded.
pub fn remap_symbols(rpn: &mut [u8], map: &[u32]) -> DiagResult<()> {
    let mut i = 0;
    while i < rpn.len() {
        let opcode = rpn[i];
        i += 1;
        match opcode {
            op::CONST => {
                i += 4;
            }
            op::SYM | op::BANK_SYM => {
                let id = read_u32(rpn, &mut i)? as usize;
                let global = map
                    .get(id)
                    .ok_or_else(|| Diag::fatal("RPN symbol ID out of range"))?;
                rpn[i - 4..i].copy_from_slice(&global.to_le_bytes());
            }
            op::BANK_SECT => {
                read_name(rpn, &mut i)?;
            }
            _ => {}
        }
        if i > rpn.len() {
            return Err(Diag::fatal("truncated RPN expression"));
        }
    }
    Ok(())
}

fn location(patch: &Patch) -> String {
    format!("{}:{}", patch.file, patch.line)
}

/// Run a patch's RPN program. Recoverable problems substitute a sentinel so
/// every broken patch in a link still gets reported.
pub fn evaluate(
    patch: &Patch,
    sections: &[Section],
    symbols: &[LinkSymbol],
    stack: &mut RpnStack,
    diag: &mut Diagnostics,
) -> DiagResult<i32> {
    stack.clear();
    let rpn = &patch.rpn;
    let mut i = 0;
    while i < rpn.len() {
        let opcode = rpn[i];
        i += 1;
        match opcode {
            op::CONST => {
                let value = read_u32(rpn, &mut i)? as i32;
                stack.push(value);
            }
            op::SYM => {
                let id = read_u32(rpn, &mut i)? as usize;
                let sym = symbols
                    .get(id)
                    .ok_or_else(|| Diag::fatal("RPN symbol ID out of range"))?;
                if sym.name == "@" {
                    match sections.get(patch.pc_section) {
                        Some(section) => {
                            let org = section.org.unwrap_or(0);
                            stack.push(org.wrapping_add(patch.pc_offset) as i32);
                        }
                        None => {
                            diag.error(format_args!(
                                "{}: PC has no value outside a section",
                                location(patch)
                            ));
                            stack.push(1);
                        }
                    }
                } else if !sym.defined {
                    diag.error(format_args!(
                        "{}: undefined symbol `{}`",
                        location(patch),
                        sym.name
                    ));
                    // 0 would alias address 0; 1 stands out less dangerously.
                    stack.push(1);
                } else {
                    stack.push(sym.address(sections));
                }
            }
            op::BANK_SYM => {
                let id = read_u32(rpn, &mut i)? as usize;
                let sym = symbols
                    .get(id)
                    .ok_or_else(|| Diag::fatal("RPN symbol ID out of range"))?;
                match (sym.defined, sym.section) {
                    (true, Some(idx)) => stack.push(sections[idx].bank.unwrap_or(0) as i32),
                    (true, None) => {
                        diag.error(format_args!(
                            "{}: `{}` has no bank",
                            location(patch),
                            sym.name
                        ));
                        stack.push(1);
                    }
                    (false, _) => {
                        diag.error(format_args!(
                            "{}: undefined symbol `{}`",
                            location(patch),
                            sym.name
                        ));
                        stack.push(1);
                    }
                }
            }
            op::BANK_SECT => {
                let name = read_name(rpn, &mut i)?;
                match sections.iter().find(|s| s.name == name) {
                    Some(section) => stack.push(section.bank.unwrap_or(0) as i32),
                    None => {
                        diag.error(format_args!(
                            "{}: no section named `{name}`",
                            location(patch)
                        ));
                        stack.push(1);
                    }
                }
            }
            op::BANK_SELF => match sections.get(patch.pc_section) {
                Some(section) => stack.push(section.bank.unwrap_or(0) as i32),
                None => {
                    diag.error(format_args!(
                        "{}: PC has no bank outside a section",
                        location(patch)
                    ));
                    stack.push(1);
                }
            },
            op::HRAM => {
                let value = stack.pop()?;
                if !(0x0000..=0x00FF).contains(&value) && !(0xFF00..=0xFFFF).contains(&value) {
                    diag.error(format_args!(
                        "{}: address ${value:X} is not in HRAM range",
                        location(patch)
                    ));
                }
                stack.push(value & 0xFF);
            }
            op::RST => {
                let value = stack.pop()?;
                if value & !0x38 != 0 {
                    diag.error(format_args!(
                        "{}: invalid RST vector ${value:X}",
                        location(patch)
                    ));
                }
                stack.push(value | 0xC7);
            }
            op::UNSUB => {
                let value = stack.pop()?;
                stack.push(value.wrapping_neg());
            }
            op::UNNOT => {
                let value = stack.pop()?;
                stack.push(!value);
            }
            op::LOGUNNOT => {
                let value = stack.pop()?;
                stack.push((value == 0) as i32);
            }
            _ => {
                // Binary operators; the left operand is popped second.
                let r = stack.pop()?;
                let l = stack.pop()?;
                let value = match opcode {
                    op::ADD => l.wrapping_add(r),
                    op::SUB => l.wrapping_sub(r),
                    op::MUL => l.wrapping_mul(r),
                    op::DIV => {
                        if r == 0 {
                            diag.error(format_args!("{}: division by zero", location(patch)));
                            i32::MAX
                        } else if l == i32::MIN && r == -1 {
                            i32::MIN
                        } else {
                            l / r
                        }
                    }
                    op::MOD => {
                        if r == 0 {
                            diag.error(format_args!("{}: modulo by zero", location(patch)));
                            0
                        } else if l == i32::MIN && r == -1 {
                            0
                        } else {
                            l % r
                        }
                    }
                    op::OR => l | r,
                    op::AND => l & r,
                    op::XOR => l ^ r,
                    op::SHL => asl(l, r),
                    op::SHR => asr(l, r),
                    op::LOGAND => ((l != 0) && (r != 0)) as i32,
                    op::LOGOR => ((l != 0) || (r != 0)) as i32,
                    op::LOGEQ => (l == r) as i32,
                    op::LOGNE => (l != r) as i32,
                    op::LOGGT => (l > r) as i32,
                    op::LOGLT => (l < r) as i32,
                    op::LOGGE => (l >= r) as i32,
                    op::LOGLE => (l <= r) as i32,
                    _ => return Err(Diag::fatal(format!("invalid RPN opcode ${opcode:02X}"))),
                };
                stack.push(value);
            }
        }
    }
    if stack.len() != 1 {
        diag.error(format_args!(
            "{}: malformed RPN expression",
            location(patch)
        ));
        return Ok(0);
    }
    stack.pop()
}

/// Check every assertion against the final section layout. Failed `Fatal`
/// assertions abort the link.
pub fn check_assertions(
    assertions: &[Assertion],
    sections: &[Section],
    symbols: &[LinkSymbol],
    stack: &mut RpnStack,
    diag: &mut Diagnostics,
) -> DiagResult<()> {
    for assertion in assertions {
        let value = evaluate(&assertion.patch, sections, symbols, stack, diag)?;
        if value != 0 {
            continue;
        }
        let msg = if assertion.message.is_empty() {
            "assertion failed".to_string()
        } else {
            format!("assertion failed: {}", assertion.message)
        };
        match assertion.kind {
            AssertKind::Warn => {
                tracing::warn!("{}: {msg}", location(&assertion.patch));
            }
            AssertKind::Error => {
                diag.error(format_args!("{}: {msg}", location(&assertion.patch)));
            }
            AssertKind::Fatal => {
                return Err(Diag::fatal(format!(
                    "{}: {msg}",
                    location(&assertion.patch)
                )));
            }
        }
    }
    Ok(())
}

/// Evaluate every patch and write the values into the section data, with
/// the width checks of each patch kind.
pub fn apply_patches(
    sections: &mut [Section],
    symbols: &[LinkSymbol],
    stack: &mut RpnStack,
    diag: &mut Diagnostics,
) -> DiagResult<()> {
    for si in 0..sections.len() {
        let patches = std::mem::take(&mut sections[si].patches);
        for patch in &patches {
            let value = evaluate(patch, sections, symbols, stack, diag)?;
            let value = match patch.kind {
                PatchKind::Byte => {
                    if !(-128..=255).contains(&value) {
                        diag.error(format_args!(
                            "{}: value {value} does not fit in 8 bits",
                            location(patch)
                        ));
                    }
                    value
                }
                PatchKind::Word => {
                    if !(-32768..=65536).contains(&value) {
                        diag.error(format_args!(
                            "{}: value {value} does not fit in 16 bits",
                            location(patch)
                        ));
                    }
                    value
                }
                PatchKind::Long => value,
                PatchKind::JrByte => {
                    let disp = value.wrapping_sub(patch.pc_after(sections));
                    if !(-128..=127).contains(&disp) {
                        diag.error(format_args!(
                            "{}: jr target out of reach (displacement {disp})",
                            location(patch)
                        ));
                    }
                    disp
                }
            };
            let start = patch.offset as usize;
            let end = start + patch.kind.size();
            let data = &mut sections[si].data;
            if end > data.len() {
                return Err(Diag::fatal(format!(
                    "{}: patch outside section data",
                    location(patch)
                )));
            }
            data[start..end].copy_from_slice(&value.to_le_bytes()[..patch.kind.size()]);
        }
    }
    Ok(())
}
