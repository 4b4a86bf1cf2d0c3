use chrono::{Datelike, Local, Timelike, Utc};
use indexmap::IndexMap;

use crate::{
    diag::{Diag, DiagResult},
    lexer::SymbolSource,
    Section,
};

/// Longest accepted symbol name, matching the object-file field width.
pub const MAX_SYM_LEN: usize = 255;

/// Everything a computed builtin can see when asked for its value.
pub struct EvalContext<'a> {
    pub sections: &'a [Section],
    pub current_section: Option<usize>,
    pub pc_offset: u32,
    pub narg: Option<u32>,
    pub file: &'a str,
    pub line: u32,
}

impl<'a> EvalContext<'a> {
    /// Current program counter. Inside a fixed-org section this is the final
    /// address; in a floating section it is the offset from the section
    /// start, which is only meaningful to same-section arithmetic.
    pub fn pc(&self) -> i32 {
        match self.current_section {
            Some(idx) => match self.sections[idx].org {
                Some(org) => org.wrapping_add(self.pc_offset) as i32,
                None => self.pc_offset as i32,
            },
            None => 0,
        }
    }

    /// Whether the PC folds to a constant here.
    pub fn pc_constant(&self) -> bool {
        matches!(self.current_section, Some(idx) if self.sections[idx].org.is_some())
    }
}

pub type NumCallback = fn(&EvalContext) -> i32;
pub type StrCallback = fn(&EvalContext) -> String;

#[derive(Clone)]
pub enum SymbolValue {
    Stored(i32),
    Computed(NumCallback),
}

#[derive(Clone)]
pub enum StringValue {
    Stored(String),
    Computed(StrCallback),
}

#[derive(Clone)]
pub enum SymbolKind {
    /// Offset into its section; the final address exists once the section
    /// org is fixed.
    Label,
    Equ,
    Set,
    Macro(String),
    Equs(StringValue),
    /// Referenced before any definition was seen.
    Ref,
}

#[derive(Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub value: SymbolValue,
    pub section: Option<usize>,
    pub exported: bool,
    pub builtin: bool,
    /// Output-table ID, assigned the first time a patch mentions the symbol.
    pub id: Option<u32>,
    pub file: String,
    pub line: u32,
}

impl Symbol {
    pub fn is_defined(&self) -> bool {
        !matches!(self.kind, SymbolKind::Ref)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Label | SymbolKind::Equ | SymbolKind::Set
        )
    }

    /// Whether the value can fold at assembly time. Labels only become
    /// constant once their section has a fixed org.
    pub fn is_constant(&self, sections: &[Section]) -> bool {
        match self.kind {
            SymbolKind::Equ | SymbolKind::Set => true,
            SymbolKind::Label => match self.section {
                Some(idx) => sections[idx].org.is_some(),
                // Sectionless labels are the computed builtins.
                None => matches!(self.value, SymbolValue::Computed(_)),
            },
            _ => false,
        }
    }

    pub fn value(&self, sections: &[Section], ctx: &EvalContext) -> i32 {
        match self.value {
            SymbolValue::Computed(cb) => cb(ctx),
            SymbolValue::Stored(v) => match (matches!(self.kind, SymbolKind::Label), self.section)
            {
                (true, Some(idx)) => match sections[idx].org {
                    Some(org) => org.wrapping_add(v as u32) as i32,
                    None => v,
                },
                _ => v,
            },
        }
    }
}

fn cb_pc(ctx: &EvalContext) -> i32 {
    ctx.pc()
}

fn cb_narg(ctx: &EvalContext) -> i32 {
    ctx.narg.unwrap_or(0) as i32
}

fn cb_line(ctx: &EvalContext) -> i32 {
    ctx.line as i32
}

fn cb_file(ctx: &EvalContext) -> String {
    format!("\"{}\"", ctx.file)
}

pub struct SymbolTable {
    symbols: IndexMap<String, Symbol>,
    scope: Option<String>,
    anon_count: u32,
    export_all: bool,
    /// Names in output-ID order.
    registry: Vec<String>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = Self {
            symbols: IndexMap::new(),
            scope: None,
            anon_count: 0,
            export_all: false,
            registry: Vec::new(),
        };
        table.install_builtins();
        table
    }

    fn install_builtins(&mut self) {
        let local = Local::now();
        let utc = Utc::now();
        self.builtin_computed("@", SymbolKind::Label, cb_pc);
        self.builtin_computed("_NARG", SymbolKind::Equ, cb_narg);
        self.builtin_computed("__LINE__", SymbolKind::Equ, cb_line);
        self.builtin_string("__FILE__", StringValue::Computed(cb_file));
        // Text builtins carry their quotes so re-lexing sees a literal.
        self.builtin_string(
            "__TIME__",
            StringValue::Stored(format!("\"{}\"", local.format("%H:%M:%S"))),
        );
        self.builtin_string(
            "__DATE__",
            StringValue::Stored(format!("\"{}\"", local.format("%d %B %Y"))),
        );
        self.builtin_string(
            "__ISO_8601_LOCAL__",
            StringValue::Stored(format!("\"{}\"", local.format("%Y-%m-%dT%H:%M:%S%z"))),
        );
        self.builtin_string(
            "__ISO_8601_UTC__",
            StringValue::Stored(format!("\"{}\"", utc.format("%Y-%m-%dT%H:%M:%SZ"))),
        );
        self.builtin_number("__UTC_YEAR__", utc.year());
        self.builtin_number("__UTC_MONTH__", utc.month() as i32);
        self.builtin_number("__UTC_DAY__", utc.day() as i32);
        self.builtin_number("__UTC_HOUR__", utc.hour() as i32);
        self.builtin_number("__UTC_MINUTE__", utc.minute() as i32);
        self.builtin_number("__UTC_SECOND__", utc.second() as i32);
    }

    fn builtin(&mut self, name: &str, kind: SymbolKind, value: SymbolValue) {
        self.symbols.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                kind,
                value,
                section: None,
                exported: false,
                builtin: true,
                id: None,
                file: "<builtin>".to_string(),
                line: 0,
            },
        );
    }

    fn builtin_computed(&mut self, name: &str, kind: SymbolKind, cb: NumCallback) {
        self.builtin(name, kind, SymbolValue::Computed(cb));
    }

    fn builtin_number(&mut self, name: &str, value: i32) {
        self.builtin(name, SymbolKind::Equ, SymbolValue::Stored(value));
    }

    fn builtin_string(&mut self, name: &str, value: StringValue) {
        self.builtin(name, SymbolKind::Equs(value), SymbolValue::Stored(0));
    }

    pub fn set_export_all(&mut self, export_all: bool) {
        self.export_all = export_all;
    }

    pub fn export_all(&self) -> bool {
        self.export_all
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn set_scope(&mut self, scope: Option<String>) {
        self.scope = scope;
    }

    /// Save the scope around a macro expansion.
    pub fn take_scope(&mut self) -> Option<String> {
        self.scope.take()
    }

    fn check_name(name: &str) -> DiagResult<()> {
        if name.len() > MAX_SYM_LEN {
            return Err(Diag::fatal("symbol name too long"));
        }
        Ok(())
    }

    /// Expand a leading-dot local through the active scope. More than one
    /// dot in the result is malformed.
    pub fn resolve_name(&self, name: &str) -> DiagResult<String> {
        let full = if name.starts_with('.') {
            match &self.scope {
                Some(scope) => format!("{scope}{name}"),
                None => {
                    return Err(Diag::fatal(format!(
                        "local label `{name}` used without a preceding global label"
                    )))
                }
            }
        } else {
            name.to_string()
        };
        if full.matches('.').count() > 1 {
            return Err(Diag::fatal(format!(
                "only one `.` allowed in symbol name `{full}`"
            )));
        }
        Self::check_name(&full)?;
        Ok(full)
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn find_scoped(&self, name: &str) -> DiagResult<Option<&Symbol>> {
        let full = self.resolve_name(name)?;
        Ok(self.symbols.get(&full))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    /// Shared redefinition gate: a `Ref` placeholder may be filled in by a
    /// label or `SET`, a live definition may not be replaced (except `Set`
    /// over `Set`). Constants, string equates, and macros refuse a
    /// referenced name outright: the forward reference already committed it
    /// to relocatable semantics.
    fn define(
        &mut self,
        name: &str,
        kind: SymbolKind,
        value: SymbolValue,
        section: Option<usize>,
        file: &str,
        line: u32,
    ) -> DiagResult<()> {
        let full = self.resolve_name(name)?;
        match self.symbols.get_mut(&full) {
            Some(sym) if sym.builtin => {
                return Err(Diag::error(format!("`{full}` is a reserved symbol")));
            }
            Some(sym) if !sym.is_defined() => {
                if !matches!(kind, SymbolKind::Label | SymbolKind::Set) {
                    return Err(Diag::error(format!(
                        "`{full}` already referenced at {}:{}",
                        sym.file, sym.line
                    )));
                }
                sym.kind = kind;
                sym.value = value;
                sym.section = section;
                sym.file = file.to_string();
                sym.line = line;
                if self.export_all && !full.starts_with('!') {
                    sym.exported = true;
                }
            }
            Some(sym)
                if matches!(sym.kind, SymbolKind::Set) && matches!(kind, SymbolKind::Set) =>
            {
                sym.value = value;
                sym.file = file.to_string();
                sym.line = line;
            }
            Some(sym) => {
                return Err(Diag::error(format!(
                    "`{full}` already defined at {}:{}",
                    sym.file, sym.line
                )));
            }
            None => {
                // Anonymous labels stay object-local even under export-all.
                let exported = self.export_all && !full.starts_with('!');
                self.symbols.insert(
                    full.clone(),
                    Symbol {
                        name: full.clone(),
                        kind,
                        value,
                        section,
                        exported,
                        builtin: false,
                        id: None,
                        file: file.to_string(),
                        line,
                    },
                );
            }
        }
        Ok(())
    }

    /// Define a label at an offset into a section. Global labels open a new
    /// local scope; leading-dot names attach to the active one.
    pub fn add_label(
        &mut self,
        name: &str,
        section: Option<usize>,
        offset: u32,
        file: &str,
        line: u32,
    ) -> DiagResult<()> {
        let Some(section) = section else {
            return Err(Diag::error(format!(
                "label `{name}` created outside of a section"
            )));
        };
        // A qualified `Parent.name` form must name the scope that is
        // actually open.
        if let Some(dot) = name.find('.') {
            if dot > 0 && self.scope.as_deref() != Some(&name[..dot]) {
                return Err(Diag::error(format!(
                    "not currently in the scope of `{}`",
                    &name[..dot]
                )));
            }
        }
        self.define(
            name,
            SymbolKind::Label,
            SymbolValue::Stored(offset as i32),
            Some(section),
            file,
            line,
        )?;
        if !name.contains('.') {
            self.scope = Some(name.to_string());
        }
        Ok(())
    }

    pub fn add_equ(&mut self, name: &str, value: i32, file: &str, line: u32) -> DiagResult<()> {
        self.define(
            name,
            SymbolKind::Equ,
            SymbolValue::Stored(value),
            None,
            file,
            line,
        )
    }

    pub fn add_set(&mut self, name: &str, value: i32, file: &str, line: u32) -> DiagResult<()> {
        self.define(
            name,
            SymbolKind::Set,
            SymbolValue::Stored(value),
            None,
            file,
            line,
        )
    }

    pub fn add_string(&mut self, name: &str, value: String, file: &str, line: u32) -> DiagResult<()> {
        self.define(
            name,
            SymbolKind::Equs(StringValue::Stored(value)),
            SymbolValue::Stored(0),
            None,
            file,
            line,
        )
    }

    pub fn add_macro(&mut self, name: &str, body: String, file: &str, line: u32) -> DiagResult<()> {
        self.define(
            name,
            SymbolKind::Macro(body),
            SymbolValue::Stored(0),
            None,
            file,
            line,
        )
    }

    /// Look a symbol up for use in an expression, creating a `Ref`
    /// placeholder on a miss so the linker knows to import it.
    pub fn reference(&mut self, name: &str, file: &str, line: u32) -> DiagResult<&Symbol> {
        let full = self.resolve_name(name)?;
        if !self.symbols.contains_key(&full) {
            self.symbols.insert(
                full.clone(),
                Symbol {
                    name: full.clone(),
                    kind: SymbolKind::Ref,
                    value: SymbolValue::Stored(0),
                    section: None,
                    exported: false,
                    builtin: false,
                    id: None,
                    file: file.to_string(),
                    line,
                },
            );
        }
        match self.symbols.get(&full) {
            Some(sym) => Ok(sym),
            None => Err(Diag::fatal("symbol table lookup failed")),
        }
    }

    pub fn export(&mut self, name: &str, file: &str, line: u32) -> DiagResult<()> {
        if name.starts_with('!') {
            return Err(Diag::error("anonymous labels cannot be exported"));
        }
        let full = self.resolve_name(name)?;
        if !self.symbols.contains_key(&full) {
            self.reference(name, file, line)?;
        }
        if let Some(sym) = self.symbols.get_mut(&full) {
            if sym.builtin {
                return Err(Diag::error(format!("`{full}` is a reserved symbol")));
            }
            sym.exported = true;
        }
        Ok(())
    }

    pub fn purge(&mut self, name: &str) -> DiagResult<()> {
        let full = self.resolve_name(name)?;
        match self.symbols.get(&full) {
            None => Err(Diag::error(format!("`{full}` is not defined"))),
            Some(sym) if sym.builtin => {
                Err(Diag::error(format!("`{full}` is a reserved symbol")))
            }
            Some(sym) if sym.id.is_some() => Err(Diag::error(format!(
                "`{full}` is referenced by a patch and cannot be purged"
            ))),
            Some(_) => {
                self.symbols.shift_remove(&full);
                if self.scope.as_deref() == Some(full.as_str()) {
                    self.scope = None;
                }
                Ok(())
            }
        }
    }

    /// Define the next anonymous label at the current position.
    pub fn add_anon_label(
        &mut self,
        section: Option<usize>,
        offset: u32,
        file: &str,
        line: u32,
    ) -> DiagResult<()> {
        let name = format!("!{}", self.anon_count);
        let Some(section) = section else {
            return Err(Diag::error("anonymous label created outside of a section"));
        };
        self.define(
            &name,
            SymbolKind::Label,
            SymbolValue::Stored(offset as i32),
            Some(section),
            file,
            line,
        )?;
        self.anon_count += 1;
        Ok(())
    }

    /// Internal name of the `ofs`-th anonymous label behind (`neg`) or ahead
    /// of the current position. `ofs` counts from 1.
    pub fn anon_label_name(&self, ofs: u32, neg: bool) -> DiagResult<String> {
        let id = if neg {
            match self.anon_count.checked_sub(ofs) {
                Some(id) => id,
                None => {
                    return Err(Diag::error(format!(
                        "reference to anonymous label {ofs} before, only {} created",
                        self.anon_count
                    )))
                }
            }
        } else {
            match self.anon_count.checked_add(ofs - 1) {
                Some(id) => id,
                None => return Err(Diag::error("too many anonymous label references")),
            }
        };
        Ok(format!("!{id}"))
    }

    /// Assign (or fetch) the output-table ID a patch uses to name a symbol.
    pub fn register_for_output(&mut self, name: &str) -> DiagResult<u32> {
        match self.symbols.get_mut(name) {
            Some(sym) => match sym.id {
                Some(id) => Ok(id),
                None => {
                    let id = self.registry.len() as u32;
                    sym.id = Some(id);
                    self.registry.push(name.to_string());
                    Ok(id)
                }
            },
            None => Err(Diag::fatal(format!("patch references unknown symbol `{name}`"))),
        }
    }

    pub fn registry(&self) -> &[String] {
        &self.registry
    }
}

impl SymbolSource for SymbolTable {
    fn string_value(&self, name: &str) -> Option<String> {
        let full = self.resolve_name(name).ok()?;
        let sym = self.symbols.get(&full)?;
        match &sym.kind {
            SymbolKind::Equs(StringValue::Stored(s)) => Some(s.clone()),
            SymbolKind::Equ | SymbolKind::Set => match sym.value {
                SymbolValue::Stored(v) => Some(format!("${v:X}")),
                SymbolValue::Computed(_) => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Section;

    fn ctx<'a>(sections: &'a [Section]) -> EvalContext<'a> {
        EvalContext {
            sections,
            current_section: None,
            pc_offset: 0,
            narg: None,
            file: "test.asm",
            line: 42,
        }
    }

    #[test]
    fn global_label_opens_scope_for_locals() {
        let mut table = SymbolTable::new();
        table.add_label("Main", Some(0), 0, "t", 1).unwrap();
        table.add_label(".loop", Some(0), 4, "t", 2).unwrap();
        assert!(table.find("Main.loop").is_some());
        let found = table.find_scoped(".loop").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn local_without_scope_is_fatal() {
        let mut table = SymbolTable::new();
        let err = table.add_label(".loop", Some(0), 0, "t", 1).unwrap_err();
        assert!(matches!(err, Diag::Fatal(_)));
    }

    #[test]
    fn nested_locals_are_fatal() {
        let mut table = SymbolTable::new();
        table.add_label("Main", Some(0), 0, "t", 1).unwrap();
        let err = table.resolve_name("Main.a.b").unwrap_err();
        assert!(matches!(err, Diag::Fatal(_)));
    }

    #[test]
    fn ref_upgrades_to_label_but_not_constant() {
        let mut table = SymbolTable::new();
        table.reference("Later", "t", 1).unwrap();
        table.export("Later", "t", 1).unwrap();
        table.add_label("Later", Some(0), 4, "t", 2).unwrap();
        let sym = table.find("Later").unwrap();
        assert!(sym.is_defined());
        assert!(sym.exported);
        // A forward reference is relocatable; it cannot become a constant.
        table.reference("K", "t", 3).unwrap();
        assert!(matches!(
            table.add_equ("K", 9, "t", 4),
            Err(Diag::Error(_))
        ));
    }

    #[test]
    fn qualified_local_must_match_open_scope() {
        let mut table = SymbolTable::new();
        table.add_label("Main", Some(0), 0, "t", 1).unwrap();
        table.add_label("Main.ok", Some(0), 1, "t", 2).unwrap();
        assert!(matches!(
            table.add_label("Other.x", Some(0), 2, "t", 3),
            Err(Diag::Error(_))
        ));
        assert!(table.find("Other.x").is_none());
    }

    #[test]
    fn anonymous_labels_never_export() {
        let mut table = SymbolTable::new();
        table.set_export_all(true);
        table.add_anon_label(Some(0), 0, "t", 1).unwrap();
        let name = table.anon_label_name(1, true).unwrap();
        assert!(!table.find(&name).unwrap().exported);
        assert!(matches!(
            table.export(&name, "t", 2),
            Err(Diag::Error(_))
        ));
    }

    #[test]
    fn set_redefines_but_equ_does_not() {
        let mut table = SymbolTable::new();
        table.add_set("V", 1, "t", 1).unwrap();
        table.add_set("V", 2, "t", 2).unwrap();
        table.add_equ("K", 1, "t", 3).unwrap();
        let err = table.add_equ("K", 2, "t", 4).unwrap_err();
        assert!(matches!(err, Diag::Error(_)));
        let sections = [];
        let c = ctx(&sections);
        assert_eq!(table.find("V").unwrap().value(&sections, &c), 2);
    }

    #[test]
    fn builtins_cannot_be_redefined_or_purged() {
        let mut table = SymbolTable::new();
        assert!(matches!(
            table.add_equ("_NARG", 1, "t", 1),
            Err(Diag::Error(_))
        ));
        assert!(matches!(table.purge("@"), Err(Diag::Error(_))));
    }

    #[test]
    fn purge_respects_patch_references() {
        let mut table = SymbolTable::new();
        table.add_equ("A", 1, "t", 1).unwrap();
        table.add_equ("B", 2, "t", 1).unwrap();
        table.register_for_output("B").unwrap();
        assert!(table.purge("A").is_ok());
        assert!(matches!(table.purge("B"), Err(Diag::Error(_))));
        assert!(matches!(table.purge("A"), Err(Diag::Error(_))));
    }

    #[test]
    fn anon_label_names() {
        let mut table = SymbolTable::new();
        table.add_anon_label(Some(0), 0, "t", 1).unwrap();
        table.add_anon_label(Some(0), 4, "t", 2).unwrap();
        assert_eq!(table.anon_label_name(1, true).unwrap(), "!1");
        assert_eq!(table.anon_label_name(2, true).unwrap(), "!0");
        assert_eq!(table.anon_label_name(1, false).unwrap(), "!2");
        assert!(matches!(
            table.anon_label_name(3, true),
            Err(Diag::Error(_))
        ));
    }

    #[test]
    fn label_constness_follows_section_org() {
        let mut table = SymbolTable::new();
        let sections = [
            Section::new("fixed".into(), Some(0x0150), None),
            Section::new("float".into(), None, None),
        ];
        table.add_label("A", Some(0), 2, "t", 1).unwrap();
        table.add_label("B", Some(1), 2, "t", 2).unwrap();
        assert!(table.find("A").unwrap().is_constant(&sections));
        assert!(!table.find("B").unwrap().is_constant(&sections));
        let c = ctx(&sections);
        assert_eq!(table.find("A").unwrap().value(&sections, &c), 0x0152);
    }

    #[test]
    fn computed_builtins_use_context() {
        let table = SymbolTable::new();
        let sections = [];
        let mut c = ctx(&sections);
        c.narg = Some(3);
        assert_eq!(table.find("__LINE__").unwrap().value(&sections, &c), 42);
        assert_eq!(table.find("_NARG").unwrap().value(&sections, &c), 3);
    }

    #[test]
    fn interpolation_values() {
        let mut table = SymbolTable::new();
        table.add_equ("N", 0x1F, "t", 1).unwrap();
        table
            .add_string("S", "hello".to_string(), "t", 2)
            .unwrap();
        assert_eq!(table.string_value("N").unwrap(), "$1F");
        assert_eq!(table.string_value("S").unwrap(), "hello");
        assert!(table.string_value("missing").is_none());
    }
}
