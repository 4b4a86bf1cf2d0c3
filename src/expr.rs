use crate::{
    diag::{Diag, DiagResult, Diagnostics},
    symbol::{EvalContext, SymbolKind, SymbolTable},
};

/// RPN program size cap; hitting it means a runaway expression.
pub const MAX_RPN_LEN: usize = 1 << 20;

const INITIAL_RPN_CAPACITY: usize = 256;

/// Opcode bytes of the serialized RPN programs. These values are the wire
/// contract between the assembler and the linker and cannot change.
pub struct RpnOp;

#[rustfmt::skip]
impl RpnOp {
    pub const ADD: u8       = 0x00;
    pub const SUB: u8       = 0x01;
    pub const MUL: u8       = 0x02;
    pub const DIV: u8       = 0x03;
    pub const MOD: u8       = 0x04;
    pub const UNSUB: u8     = 0x05;

    pub const OR: u8        = 0x10;
    pub const AND: u8       = 0x11;
    pub const XOR: u8       = 0x12;
    pub const UNNOT: u8     = 0x13;

    pub const LOGAND: u8    = 0x21;
    pub const LOGOR: u8     = 0x22;
    pub const LOGUNNOT: u8  = 0x23;

    pub const LOGEQ: u8     = 0x30;
    pub const LOGNE: u8     = 0x31;
    pub const LOGGT: u8     = 0x32;
    pub const LOGLT: u8     = 0x33;
    pub const LOGGE: u8     = 0x34;
    pub const LOGLE: u8     = 0x35;

    pub const SHL: u8       = 0x40;
    pub const SHR: u8       = 0x41;

    pub const BANK_SYM: u8  = 0x50;
    pub const BANK_SECT: u8 = 0x51;
    pub const BANK_SELF: u8 = 0x52;

    pub const HRAM: u8      = 0x60;
    pub const RST: u8       = 0x61;

    pub const CONST: u8     = 0x80;
    pub const SYM: u8       = 0x81;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl BinaryOp {
    /// Wire opcode; exponentiation has none and must fold.
    fn rpn(self) -> Option<u8> {
        match self {
            BinaryOp::Add => Some(RpnOp::ADD),
            BinaryOp::Sub => Some(RpnOp::SUB),
            BinaryOp::Mul => Some(RpnOp::MUL),
            BinaryOp::Div => Some(RpnOp::DIV),
            BinaryOp::Mod => Some(RpnOp::MOD),
            BinaryOp::Exp => None,
            BinaryOp::And => Some(RpnOp::AND),
            BinaryOp::Or => Some(RpnOp::OR),
            BinaryOp::Xor => Some(RpnOp::XOR),
            BinaryOp::Shl => Some(RpnOp::SHL),
            BinaryOp::Shr => Some(RpnOp::SHR),
            BinaryOp::LogAnd => Some(RpnOp::LOGAND),
            BinaryOp::LogOr => Some(RpnOp::LOGOR),
            BinaryOp::Eq => Some(RpnOp::LOGEQ),
            BinaryOp::Ne => Some(RpnOp::LOGNE),
            BinaryOp::Gt => Some(RpnOp::LOGGT),
            BinaryOp::Lt => Some(RpnOp::LOGLT),
            BinaryOp::Ge => Some(RpnOp::LOGGE),
            BinaryOp::Le => Some(RpnOp::LOGLE),
        }
    }
}

/// Arithmetic shift right with defined out-of-range behavior: shifting by
/// 32 or more yields the sign fill, negative amounts shift the other way.
pub fn asr(value: i32, amount: i32) -> i32 {
    let amount = amount.clamp(-32, 32);
    if amount >= 32 {
        return if value < 0 { -1 } else { 0 };
    }
    if amount < 0 {
        return asl(value, -amount);
    }
    value >> amount
}

/// Shift left on the bit pattern; overflow falls off the top.
pub fn asl(value: i32, amount: i32) -> i32 {
    let amount = amount.clamp(-32, 32);
    if amount >= 32 {
        return 0;
    }
    if amount < 0 {
        return asr(value, -amount);
    }
    ((value as u32) << amount) as i32
}

/// A compiled expression that could not fold: a serialized RPN program plus
/// the bookkeeping the patch machinery needs. Symbol operands carry their
/// names NUL-terminated at this stage; patch creation swaps them for output
/// IDs.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownExpr {
    pub rpn: Vec<u8>,
    /// Why the value is unknown, for messages that need a culprit.
    pub reason: String,
    /// Byte size after conversion to the patch encoding.
    pub patch_size: usize,
    /// True while the program is a single bare symbol reference.
    pub is_symbol: bool,
}

impl UnknownExpr {
    fn new(reason: String) -> Self {
        Self {
            rpn: Vec::with_capacity(INITIAL_RPN_CAPACITY),
            reason,
            patch_size: 0,
            is_symbol: false,
        }
    }

    fn reserve(&mut self, extra: usize) -> DiagResult<()> {
        if self.rpn.len() + extra > MAX_RPN_LEN {
            return Err(Diag::fatal("expression too large"));
        }
        self.rpn.reserve(extra);
        Ok(())
    }

    fn push_op(&mut self, op: u8) -> DiagResult<()> {
        self.reserve(1)?;
        self.rpn.push(op);
        self.patch_size += 1;
        Ok(())
    }

    fn push_const(&mut self, value: i32) -> DiagResult<()> {
        self.reserve(5)?;
        self.rpn.push(RpnOp::CONST);
        self.rpn.extend_from_slice(&value.to_le_bytes());
        self.patch_size += 5;
        Ok(())
    }

    /// `SYM`/`BANK_SYM`: the name is inline here but becomes a 4-byte ID in
    /// the patch encoding.
    fn push_symbol(&mut self, op: u8, name: &str) -> DiagResult<()> {
        self.reserve(1 + name.len() + 1)?;
        self.rpn.push(op);
        self.rpn.extend_from_slice(name.as_bytes());
        self.rpn.push(0);
        self.patch_size += 5;
        Ok(())
    }

    /// `BANK_SECT` keeps its name through the patch encoding.
    fn push_section(&mut self, name: &str) -> DiagResult<()> {
        self.reserve(1 + name.len() + 1)?;
        self.rpn.push(RpnOp::BANK_SECT);
        self.rpn.extend_from_slice(name.as_bytes());
        self.rpn.push(0);
        self.patch_size += 1 + name.len() + 1;
        Ok(())
    }

    /// Name of the symbol a bare-symbol program references.
    fn symbol_name(&self) -> Option<&str> {
        if !self.is_symbol || self.rpn.first() != Some(&RpnOp::SYM) {
            return None;
        }
        let name = &self.rpn[1..self.rpn.len() - 1];
        std::str::from_utf8(name).ok()
    }

    fn append(&mut self, other: &UnknownExpr) -> DiagResult<()> {
        self.reserve(other.rpn.len())?;
        self.rpn.extend_from_slice(&other.rpn);
        self.patch_size += other.patch_size;
        Ok(())
    }
}

/// A compiled (sub-)expression: either an already-folded constant or an RPN
/// program for the linker.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Known(i32),
    Unknown(UnknownExpr),
}

impl Expr {
    pub fn number(value: i32) -> Expr {
        Expr::Known(value)
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Expr::Known(_))
    }

    /// Reference a symbol, folding to its value when it is already constant.
    /// `@` folds only inside a fixed-org section.
    pub fn symbol(
        name: &str,
        syms: &mut SymbolTable,
        ctx: &EvalContext,
        diag: &mut Diagnostics,
    ) -> DiagResult<Expr> {
        if name == "@" {
            if ctx.current_section.is_none() {
                diag.error(format_args!(
                    "{}:{}: PC has no value outside a section",
                    ctx.file, ctx.line
                ));
                return Ok(Expr::Known(0));
            }
            if ctx.pc_constant() {
                return Ok(Expr::Known(ctx.pc()));
            }
            let mut out = UnknownExpr::new("PC is not constant at assembly time".to_string());
            out.push_symbol(RpnOp::SYM, "@")?;
            out.is_symbol = true;
            return Ok(Expr::Unknown(out));
        }
        let sym = syms.reference(name, ctx.file, ctx.line)?;
        if sym.is_defined() && !sym.is_numeric() {
            let full = sym.name.clone();
            diag.error(format_args!(
                "{}:{}: `{full}` is not a numeric symbol",
                ctx.file, ctx.line
            ));
            return Ok(Expr::Known(0));
        }
        if sym.is_constant(ctx.sections) {
            return Ok(Expr::Known(sym.value(ctx.sections, ctx)));
        }
        let full = sym.name.clone();
        let mut out = UnknownExpr::new(format!("`{full}` is not constant at assembly time"));
        out.push_symbol(RpnOp::SYM, &full)?;
        out.is_symbol = true;
        Ok(Expr::Unknown(out))
    }

    /// `BANK(symbol)`: folds once the symbol's section has a fixed bank.
    pub fn bank_symbol(
        name: &str,
        syms: &mut SymbolTable,
        ctx: &EvalContext,
        diag: &mut Diagnostics,
    ) -> DiagResult<Expr> {
        let sym = syms.reference(name, ctx.file, ctx.line)?;
        if sym.is_defined() && !matches!(sym.kind, SymbolKind::Label) {
            let full = sym.name.clone();
            diag.error(format_args!(
                "{}:{}: BANK argument `{full}` must be a label",
                ctx.file, ctx.line
            ));
            return Ok(Expr::Known(0));
        }
        if let Some(idx) = sym.section {
            if let Some(bank) = ctx.sections[idx].bank {
                return Ok(Expr::Known(bank as i32));
            }
        }
        let full = sym.name.clone();
        let mut out = UnknownExpr::new(format!("bank of `{full}` is not known at assembly time"));
        out.push_symbol(RpnOp::BANK_SYM, &full)?;
        Ok(Expr::Unknown(out))
    }

    /// `BANK("section")`: the section may not even exist yet.
    pub fn bank_section(name: &str, ctx: &EvalContext) -> DiagResult<Expr> {
        if let Some(section) = ctx.sections.iter().find(|s| s.name == name) {
            if let Some(bank) = section.bank {
                return Ok(Expr::Known(bank as i32));
            }
        }
        let mut out =
            UnknownExpr::new(format!("bank of section `{name}` is not known at assembly time"));
        out.push_section(name)?;
        Ok(Expr::Unknown(out))
    }

    /// `BANK(@)`.
    pub fn bank_self(ctx: &EvalContext, diag: &mut Diagnostics) -> DiagResult<Expr> {
        let Some(idx) = ctx.current_section else {
            diag.error(format_args!(
                "{}:{}: PC has no bank outside a section",
                ctx.file, ctx.line
            ));
            return Ok(Expr::Known(0));
        };
        if let Some(bank) = ctx.sections[idx].bank {
            return Ok(Expr::Known(bank as i32));
        }
        let mut out = UnknownExpr::new("bank is not known at assembly time".to_string());
        out.push_op(RpnOp::BANK_SELF)?;
        Ok(Expr::Unknown(out))
    }

    /// `HIGH(e)` expands to `(e >> 8) & $FF`.
    pub fn high(
        self,
        syms: &SymbolTable,
        ctx: &EvalContext,
        diag: &mut Diagnostics,
    ) -> DiagResult<Expr> {
        let shifted = Expr::binary(BinaryOp::Shr, self, Expr::Known(8), syms, ctx, diag)?;
        Expr::binary(BinaryOp::And, shifted, Expr::Known(0xFF), syms, ctx, diag)
    }

    /// `LOW(e)` expands to `e & $FF`.
    pub fn low(
        self,
        syms: &SymbolTable,
        ctx: &EvalContext,
        diag: &mut Diagnostics,
    ) -> DiagResult<Expr> {
        Expr::binary(BinaryOp::And, self, Expr::Known(0xFF), syms, ctx, diag)
    }

    /// `ISCONST(e)` always folds: 1 if the operand did.
    pub fn is_const(self) -> Expr {
        Expr::Known(self.is_known() as i32)
    }

    /// Unary minus.
    pub fn negate(self) -> DiagResult<Expr> {
        match self {
            Expr::Known(v) => Ok(Expr::Known(v.wrapping_neg())),
            Expr::Unknown(mut e) => {
                e.push_op(RpnOp::UNSUB)?;
                e.is_symbol = false;
                Ok(Expr::Unknown(e))
            }
        }
    }

    /// Bitwise complement.
    pub fn complement(self) -> DiagResult<Expr> {
        match self {
            Expr::Known(v) => Ok(Expr::Known(!v)),
            Expr::Unknown(mut e) => {
                e.push_op(RpnOp::UNNOT)?;
                e.is_symbol = false;
                Ok(Expr::Unknown(e))
            }
        }
    }

    /// Logical not.
    pub fn log_not(self) -> DiagResult<Expr> {
        match self {
            Expr::Known(v) => Ok(Expr::Known((v == 0) as i32)),
            Expr::Unknown(mut e) => {
                e.push_op(RpnOp::LOGUNNOT)?;
                e.is_symbol = false;
                Ok(Expr::Unknown(e))
            }
        }
    }

    /// Narrow to an `LDH` operand: accepts `$0000..=$00FF` and
    /// `$FF00..=$FFFF`, keeps the low byte.
    pub fn check_hram(self, ctx: &EvalContext, diag: &mut Diagnostics) -> DiagResult<Expr> {
        match self {
            Expr::Known(v) => {
                if !(0x0000..=0x00FF).contains(&v) && !(0xFF00..=0xFFFF).contains(&v) {
                    diag.error(format_args!(
                        "{}:{}: address ${v:X} is not in HRAM range",
                        ctx.file, ctx.line
                    ));
                }
                Ok(Expr::Known(v & 0xFF))
            }
            Expr::Unknown(mut e) => {
                e.push_op(RpnOp::HRAM)?;
                e.is_symbol = false;
                Ok(Expr::Unknown(e))
            }
        }
    }

    /// Narrow to an `RST` opcode: the vector must be a multiple of 8 up to
    /// `$38`; the result ORs in the `RST` base opcode.
    pub fn check_rst(self, ctx: &EvalContext, diag: &mut Diagnostics) -> DiagResult<Expr> {
        match self {
            Expr::Known(v) => {
                if v & !0x38 != 0 {
                    diag.error(format_args!(
                        "{}:{}: invalid RST vector ${v:X}",
                        ctx.file, ctx.line
                    ));
                }
                Ok(Expr::Known(v | 0xC7))
            }
            Expr::Unknown(mut e) => {
                e.push_op(RpnOp::RST)?;
                e.is_symbol = false;
                Ok(Expr::Unknown(e))
            }
        }
    }

    /// True when `lhs - rhs` is the distance between two labels of the same
    /// section, which is fixed even while the section floats.
    fn label_difference(lhs: &UnknownExpr, rhs: &UnknownExpr, syms: &SymbolTable) -> Option<i32> {
        let lname = lhs.symbol_name()?;
        let rname = rhs.symbol_name()?;
        let lsym = syms.find(lname)?;
        let rsym = syms.find(rname)?;
        if !matches!(lsym.kind, SymbolKind::Label) || !matches!(rsym.kind, SymbolKind::Label) {
            return None;
        }
        let (lsect, rsect) = (lsym.section?, rsym.section?);
        if lsect != rsect {
            return None;
        }
        match (&lsym.value, &rsym.value) {
            (
                crate::symbol::SymbolValue::Stored(a),
                crate::symbol::SymbolValue::Stored(b),
            ) => Some(a.wrapping_sub(*b)),
            _ => None,
        }
    }

    fn fold(op: BinaryOp, l: i32, r: i32, ctx: &EvalContext) -> DiagResult<i32> {
        Ok(match op {
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::Div => {
                if r == 0 {
                    return Err(Diag::fatal("division by zero"));
                }
                if l == i32::MIN && r == -1 {
                    tracing::warn!(
                        "{}:{}: division of {} by -1 yields itself",
                        ctx.file,
                        ctx.line,
                        i32::MIN
                    );
                    i32::MIN
                } else {
                    l / r
                }
            }
            BinaryOp::Mod => {
                if r == 0 {
                    return Err(Diag::fatal("modulo by zero"));
                }
                if l == i32::MIN && r == -1 {
                    0
                } else {
                    l % r
                }
            }
            BinaryOp::Exp => {
                if r < 0 {
                    return Err(Diag::fatal("exponent must not be negative"));
                }
                let mut acc = 1i32;
                let mut base = l;
                let mut exp = r as u32;
                while exp > 0 {
                    if exp & 1 != 0 {
                        acc = acc.wrapping_mul(base);
                    }
                    base = base.wrapping_mul(base);
                    exp >>= 1;
                }
                acc
            }
            BinaryOp::And => l & r,
            BinaryOp::Or => l | r,
            BinaryOp::Xor => l ^ r,
            BinaryOp::Shl => {
                if r < 0 {
                    tracing::warn!("{}:{}: shifting left by negative amount {r}", ctx.file, ctx.line);
                } else if r >= 32 {
                    tracing::warn!("{}:{}: shifting left by large amount {r}", ctx.file, ctx.line);
                }
                asl(l, r)
            }
            BinaryOp::Shr => {
                if r < 0 {
                    tracing::warn!("{}:{}: shifting right by negative amount {r}", ctx.file, ctx.line);
                } else if r >= 32 {
                    tracing::warn!("{}:{}: shifting right by large amount {r}", ctx.file, ctx.line);
                }
                asr(l, r)
            }
            BinaryOp::LogAnd => ((l != 0) && (r != 0)) as i32,
            BinaryOp::LogOr => ((l != 0) || (r != 0)) as i32,
            BinaryOp::Eq => (l == r) as i32,
            BinaryOp::Ne => (l != r) as i32,
            BinaryOp::Gt => (l > r) as i32,
            BinaryOp::Lt => (l < r) as i32,
            BinaryOp::Ge => (l >= r) as i32,
            BinaryOp::Le => (l <= r) as i32,
        })
    }

    /// Combine two compiled expressions. Both operands are consumed; the
    /// merged program is allocated fresh.
    pub fn binary(
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
        syms: &SymbolTable,
        ctx: &EvalContext,
        diag: &mut Diagnostics,
    ) -> DiagResult<Expr> {
        if let (Expr::Known(l), Expr::Known(r)) = (&lhs, &rhs) {
            return Ok(Expr::Known(Self::fold(op, *l, *r, ctx)?));
        }
        if op == BinaryOp::Sub {
            if let (Expr::Unknown(l), Expr::Unknown(r)) = (&lhs, &rhs) {
                if let Some(diff) = Self::label_difference(l, r, syms) {
                    return Ok(Expr::Known(diff));
                }
            }
        }
        let Some(opcode) = op.rpn() else {
            diag.error(format_args!(
                "{}:{}: exponentiation operands must be constant",
                ctx.file, ctx.line
            ));
            return Ok(Expr::Known(0));
        };
        // The unknown side's reason survives; the right one wins when both
        // are unknown.
        let reason = match (&lhs, &rhs) {
            (_, Expr::Unknown(r)) => r.reason.clone(),
            (Expr::Unknown(l), _) => l.reason.clone(),
            _ => String::new(),
        };
        let mut out = UnknownExpr::new(reason);
        match &lhs {
            Expr::Known(v) => out.push_const(*v)?,
            Expr::Unknown(e) => out.append(e)?,
        }
        match &rhs {
            Expr::Known(v) => out.push_const(*v)?,
            Expr::Unknown(e) => out.append(e)?,
        }
        out.push_op(opcode)?;
        Ok(Expr::Unknown(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{symbol::SymbolTable, Section};

    fn ctx<'a>(sections: &'a [Section], current: Option<usize>, pc: u32) -> EvalContext<'a> {
        EvalContext {
            sections,
            current_section: current,
            pc_offset: pc,
            narg: None,
            file: "test.asm",
            line: 1,
        }
    }

    fn known(e: Expr) -> i32 {
        match e {
            Expr::Known(v) => v,
            Expr::Unknown(_) => panic!("expected known value"),
        }
    }

    fn unknown(e: Expr) -> UnknownExpr {
        match e {
            Expr::Unknown(e) => e,
            Expr::Known(v) => panic!("expected unknown value, got {v}"),
        }
    }

    fn fold2(op: BinaryOp, l: i32, r: i32) -> DiagResult<i32> {
        let sections = [];
        let c = ctx(&sections, None, 0);
        let syms = SymbolTable::new();
        let mut diag = Diagnostics::new();
        Expr::binary(op, Expr::Known(l), Expr::Known(r), &syms, &c, &mut diag).map(known)
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(fold2(BinaryOp::Add, i32::MAX, 1).unwrap(), i32::MIN);
        assert_eq!(fold2(BinaryOp::Mul, i32::MIN, -1).unwrap(), i32::MIN);
        assert_eq!(known(Expr::Known(i32::MIN).negate().unwrap()), i32::MIN);
    }

    #[test]
    fn division_edge_cases() {
        assert!(matches!(fold2(BinaryOp::Div, 1, 0), Err(Diag::Fatal(_))));
        assert!(matches!(fold2(BinaryOp::Mod, 1, 0), Err(Diag::Fatal(_))));
        assert_eq!(fold2(BinaryOp::Div, i32::MIN, -1).unwrap(), i32::MIN);
        assert_eq!(fold2(BinaryOp::Mod, i32::MIN, -1).unwrap(), 0);
        assert_eq!(fold2(BinaryOp::Div, 7, -2).unwrap(), -3);
    }

    #[test]
    fn exponent_folds_or_errors() {
        assert_eq!(fold2(BinaryOp::Exp, 3, 4).unwrap(), 81);
        assert_eq!(fold2(BinaryOp::Exp, 2, 40).unwrap(), 2i32.wrapping_pow(40));
        assert!(matches!(fold2(BinaryOp::Exp, 2, -1), Err(Diag::Fatal(_))));
    }

    #[test]
    fn shift_semantics() {
        assert_eq!(asr(-8, 1), -4);
        assert_eq!(asr(-8, 31), -1);
        assert_eq!(asr(-8, 40), -1);
        assert_eq!(asr(8, 40), 0);
        assert_eq!(asl(1, 31), i32::MIN);
        assert_eq!(asl(1, 32), 0);
        assert_eq!(asl(-16, -2), asr(-16, 2));
        assert_eq!(asr(-16, -2), asl(-16, 2));
        assert_eq!(fold2(BinaryOp::Shr, -8, 1).unwrap(), -4);
        assert_eq!(fold2(BinaryOp::Shl, 1, 33).unwrap(), 0);
    }

    #[test]
    fn same_section_label_difference_folds() {
        let sections = [Section::new("code".into(), None, None)];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 10, "t", 1).unwrap();
        syms.add_label("B", Some(0), 4, "t", 2).unwrap();
        let c = ctx(&sections, Some(0), 0);
        let mut diag = Diagnostics::new();
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let b = Expr::symbol("B", &mut syms, &c, &mut diag).unwrap();
        assert!(!a.is_known());
        let diff = Expr::binary(BinaryOp::Sub, a, b, &syms, &c, &mut diag).unwrap();
        assert_eq!(known(diff), 6);
        // Addition of the same operands stays unknown.
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let b = Expr::symbol("B", &mut syms, &c, &mut diag).unwrap();
        let sum = Expr::binary(BinaryOp::Add, a, b, &syms, &c, &mut diag).unwrap();
        assert!(!sum.is_known());
    }

    #[test]
    fn unknown_merge_serializes_const_shim() {
        let sections = [Section::new("code".into(), None, None)];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 0, "t", 1).unwrap();
        let c = ctx(&sections, Some(0), 0);
        let mut diag = Diagnostics::new();
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let sum =
            Expr::binary(BinaryOp::Add, a, Expr::Known(5), &syms, &c, &mut diag).unwrap();
        let e = unknown(sum);
        let mut expect = vec![RpnOp::SYM];
        expect.extend_from_slice(b"A\0");
        expect.push(RpnOp::CONST);
        expect.extend_from_slice(&5i32.to_le_bytes());
        expect.push(RpnOp::ADD);
        assert_eq!(e.rpn, expect);
        // SYM costs 5 bytes in the patch encoding regardless of name length.
        assert_eq!(e.patch_size, 5 + 5 + 1);
        assert!(!e.is_symbol);
    }

    #[test]
    fn reason_prefers_right_operand() {
        let sections = [Section::new("code".into(), None, None)];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 0, "t", 1).unwrap();
        let c = ctx(&sections, Some(0), 0);
        let mut diag = Diagnostics::new();
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let b = Expr::symbol("B", &mut syms, &c, &mut diag).unwrap();
        let sum = Expr::binary(BinaryOp::Add, a, b, &syms, &c, &mut diag).unwrap();
        assert!(unknown(sum).reason.contains("`B`"));
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let sum =
            Expr::binary(BinaryOp::Add, a, Expr::Known(1), &syms, &c, &mut diag).unwrap();
        assert!(unknown(sum).reason.contains("`A`"));
    }

    #[test]
    fn high_expands_to_shift_and_mask() {
        let sections = [Section::new("code".into(), None, None)];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 0, "t", 1).unwrap();
        let c = ctx(&sections, Some(0), 0);
        let mut diag = Diagnostics::new();
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        let e = unknown(a.high(&syms, &c, &mut diag).unwrap());
        let mut expect = vec![RpnOp::SYM];
        expect.extend_from_slice(b"A\0");
        expect.push(RpnOp::CONST);
        expect.extend_from_slice(&8i32.to_le_bytes());
        expect.push(RpnOp::SHR);
        expect.push(RpnOp::CONST);
        expect.extend_from_slice(&0xFFi32.to_le_bytes());
        expect.push(RpnOp::AND);
        assert_eq!(e.rpn, expect);
        assert_eq!(known(Expr::Known(0x1234).high(&syms, &c, &mut diag).unwrap()), 0x12);
        assert_eq!(known(Expr::Known(0x1234).low(&syms, &c, &mut diag).unwrap()), 0x34);
    }

    #[test]
    fn hram_narrowing() {
        let sections = [];
        let c = ctx(&sections, None, 0);
        let mut diag = Diagnostics::new();
        assert_eq!(known(Expr::Known(0xFF80).check_hram(&c, &mut diag).unwrap()), 0x80);
        assert_eq!(known(Expr::Known(0x0042).check_hram(&c, &mut diag).unwrap()), 0x42);
        assert_eq!(diag.error_count(), 0);
        assert_eq!(known(Expr::Known(0x1234).check_hram(&c, &mut diag).unwrap()), 0x34);
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn rst_narrowing() {
        let sections = [];
        let c = ctx(&sections, None, 0);
        let mut diag = Diagnostics::new();
        assert_eq!(known(Expr::Known(0x18).check_rst(&c, &mut diag).unwrap()), 0xDF);
        assert_eq!(diag.error_count(), 0);
        assert_eq!(known(Expr::Known(0x09).check_rst(&c, &mut diag).unwrap()), 0x09 | 0xC7);
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn pc_folds_in_fixed_sections() {
        let sections = [
            Section::new("fixed".into(), Some(0x0150), None),
            Section::new("float".into(), None, None),
        ];
        let mut syms = SymbolTable::new();
        let mut diag = Diagnostics::new();
        let c = ctx(&sections, Some(0), 3);
        assert_eq!(
            known(Expr::symbol("@", &mut syms, &c, &mut diag).unwrap()),
            0x0153
        );
        let c = ctx(&sections, Some(1), 3);
        assert!(!Expr::symbol("@", &mut syms, &c, &mut diag).unwrap().is_known());
        let c = ctx(&sections, None, 0);
        assert_eq!(
            known(Expr::symbol("@", &mut syms, &c, &mut diag).unwrap()),
            0
        );
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn isconst_always_folds() {
        let sections = [Section::new("code".into(), None, None)];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 0, "t", 1).unwrap();
        let c = ctx(&sections, Some(0), 0);
        let mut diag = Diagnostics::new();
        let a = Expr::symbol("A", &mut syms, &c, &mut diag).unwrap();
        assert_eq!(known(a.is_const()), 0);
        assert_eq!(known(Expr::Known(7).is_const()), 1);
    }

    #[test]
    fn bank_folds_when_fixed() {
        let sections = [
            Section::new("banked".into(), None, Some(3)),
            Section::new("floating".into(), None, None),
        ];
        let mut syms = SymbolTable::new();
        syms.add_label("A", Some(0), 0, "t", 1).unwrap();
        syms.add_label("B", Some(1), 0, "t", 2).unwrap();
        let c = ctx(&sections, Some(1), 0);
        let mut diag = Diagnostics::new();
        assert_eq!(
            known(Expr::bank_symbol("A", &mut syms, &c, &mut diag).unwrap()),
            3
        );
        assert!(!Expr::bank_symbol("B", &mut syms, &c, &mut diag)
            .unwrap()
            .is_known());
        assert_eq!(known(Expr::bank_section("banked", &c).unwrap()), 3);
        let e = unknown(Expr::bank_section("nowhere", &c).unwrap());
        assert_eq!(e.rpn[0], RpnOp::BANK_SECT);
        assert_eq!(e.patch_size, 1 + "nowhere".len() + 1);
        assert!(!Expr::bank_self(&c, &mut diag).unwrap().is_known());
        let c = ctx(&sections, Some(0), 0);
        assert_eq!(known(Expr::bank_self(&c, &mut diag).unwrap()), 3);
    }

    #[test]
    fn rpn_size_is_capped() {
        let mut e = UnknownExpr::new(String::new());
        e.rpn = vec![0; MAX_RPN_LEN];
        assert!(matches!(e.push_op(RpnOp::ADD), Err(Diag::Fatal(_))));
    }
}
