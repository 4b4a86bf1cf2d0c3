use std::{
    collections::HashMap,
    error::Error,
    fs::File,
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use gbasm::{
    diag::Diagnostics,
    expr::MAX_RPN_LEN,
    patch::{
        apply_patches, check_assertions, remap_symbols, AssertKind, Assertion, LinkSymbol,
        Patch, PatchKind, RpnStack, NO_PC_SECTION,
    },
    Section,
};
use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer};
use serde_derive::Deserialize;
use tracing::Level;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Object files
    objects: Vec<PathBuf>,

    /// Config file
    #[arg(short, long)]
    config: PathBuf,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pre-defined symbols (repeatable)
    #[arg(short = 'D', long, value_name="KEY1=val", value_parser = gbasm::parse_defines::<String, i32>)]
    define: Vec<(String, i32)>,

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
    let mut config = File::open(args.config).map_err(|e| format!("cant open file: {e}"))?;
    let mut config_text = String::new();
    config.read_to_string(&mut config_text)?;
    let config: Script = toml::from_str(&config_text)?;

    let mut ld = Ld::new();
    for (name, value) in &args.define {
        ld.add_define(name, *value);
    }

    tracing::trace!("loading objects");
    for object in &args.objects {
        let path = object.to_string_lossy().into_owned();
        let file = File::open(object).map_err(|e| format!("cant open file: {path}: {e}"))?;
        ld.load(&path, BufReader::new(file))?;
    }

    tracing::trace!("placing sections");
    ld.place(&config)?;

    tracing::trace!("linking");
    let mut stack = RpnStack::new();
    check_assertions(
        &ld.assertions,
        &ld.sections,
        &ld.symbols,
        &mut stack,
        &mut ld.diag,
    )
    .map_err(|e| e.message().to_string())?;
    apply_patches(&mut ld.sections, &ld.symbols, &mut stack, &mut ld.diag)
        .map_err(|e| e.message().to_string())?;
    if ld.diag.error_count() > 0 {
        return Err(format!("link failed with {} error(s)", ld.diag.error_count()).into());
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
    ld.write_rom(&config, &mut output)?;
    Ok(())
}

fn err(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

fn err_in(file: &str, msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, format!("{file}: {msg}"))
}

/// One symbol as it sits in an object file. A `ty` of 0 is an import by
/// name; 1 and 2 are definitions, local and exported.
struct ObjSymbol {
    name: String,
    ty: u8,
    section: Option<usize>,
    value: i32,
}

struct ObjSection {
    name: String,
    org: Option<u32>,
    bank: Option<u32>,
    data: Vec<u8>,
    patches: Vec<Patch>,
}

struct Object {
    symbols: Vec<ObjSymbol>,
    sections: Vec<ObjSection>,
    assertions: Vec<Assertion>,
}

struct Ld {
    sections: Vec<Section>,
    symbols: Vec<LinkSymbol>,
    /// Names visible across objects: exported definitions plus imports
    /// still waiting for one.
    exports: HashMap<String, usize>,
    assertions: Vec<Assertion>,
    diag: Diagnostics,
}

impl Ld {
    fn new() -> Self {
        Self {
            sections: Vec::new(),
            symbols: Vec::new(),
            exports: HashMap::new(),
            assertions: Vec::new(),
            diag: Diagnostics::new(),
        }
    }

    /// Command-line defines act like exported constants.
    fn add_define(&mut self, name: &str, value: i32) {
        if let Some(&idx) = self.exports.get(name) {
            self.symbols[idx].value = value;
            self.symbols[idx].defined = true;
            return;
        }
        self.symbols.push(LinkSymbol {
            name: name.to_string(),
            value,
            section: None,
            defined: true,
        });
        self.exports.insert(name.to_string(), self.symbols.len() - 1);
    }

    fn load<R: Read>(&mut self, file: &str, reader: R) -> io::Result<()> {
        let object = read_object(file, reader)?;
        self.merge(file, object)
    }

    /// Find or create the global entry an import resolves to. A later
    /// object may still provide the definition.
    fn import(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.exports.get(name) {
            return idx;
        }
        self.symbols.push(LinkSymbol {
            name: name.to_string(),
            value: 0,
            section: None,
            defined: false,
        });
        let idx = self.symbols.len() - 1;
        self.exports.insert(name.to_string(), idx);
        idx
    }

    fn export(
        &mut self,
        file: &str,
        name: String,
        value: i32,
        section: Option<usize>,
    ) -> io::Result<usize> {
        if let Some(&idx) = self.exports.get(&name) {
            if self.symbols[idx].defined {
                return Err(err_in(
                    file,
                    &format!("duplicate exported symbol `{name}`"),
                ));
            }
            let sym = &mut self.symbols[idx];
            sym.value = value;
            sym.section = section;
            sym.defined = true;
            return Ok(idx);
        }
        self.symbols.push(LinkSymbol {
            name: name.clone(),
            value,
            section,
            defined: true,
        });
        let idx = self.symbols.len() - 1;
        self.exports.insert(name, idx);
        Ok(idx)
    }

    fn merge(&mut self, file: &str, object: Object) -> io::Result<()> {
        // Same-name sections concatenate; every offset in the incoming
        // object gets rebased by the data already there.
        let mut sect_map = Vec::with_capacity(object.sections.len());
        let mut pending = Vec::with_capacity(object.sections.len());
        for local in object.sections {
            let (idx, base) = match self.sections.iter().position(|s| s.name == local.name) {
                Some(idx) => {
                    let section = &mut self.sections[idx];
                    if let (Some(a), Some(b)) = (section.org, local.org) {
                        if a != b {
                            return Err(err_in(
                                file,
                                &format!("conflicting ORG for section `{}`", local.name),
                            ));
                        }
                    }
                    if let (Some(a), Some(b)) = (section.bank, local.bank) {
                        if a != b {
                            return Err(err_in(
                                file,
                                &format!("conflicting BANK for section `{}`", local.name),
                            ));
                        }
                    }
                    section.org = section.org.or(local.org);
                    section.bank = section.bank.or(local.bank);
                    let base = section.data.len() as u32;
                    tracing::trace!(
                        "extending section \"{}\" by {} bytes",
                        local.name,
                        local.data.len()
                    );
                    section.data.extend_from_slice(&local.data);
                    (idx, base)
                }
                None => {
                    tracing::trace!("loading section \"{}\"", local.name);
                    self.sections.push(Section {
                        name: local.name,
                        org: local.org,
                        bank: local.bank,
                        data: local.data,
                        patches: Vec::new(),
                    });
                    (self.sections.len() - 1, 0)
                }
            };
            sect_map.push((idx, base));
            pending.push((idx, base, local.patches));
        }

        let mut id_map = Vec::with_capacity(object.symbols.len());
        for sym in object.symbols {
            let (section, value) = match sym.section {
                Some(local) => {
                    let &(idx, base) = sect_map
                        .get(local)
                        .ok_or_else(|| err_in(file, "symbol section out of range"))?;
                    (Some(idx), sym.value.wrapping_add(base as i32))
                }
                None => (None, sym.value),
            };
            let idx = match sym.ty {
                0 => self.import(&sym.name),
                1 => {
                    self.symbols.push(LinkSymbol {
                        name: sym.name,
                        value,
                        section,
                        defined: true,
                    });
                    self.symbols.len() - 1
                }
                _ => self.export(file, sym.name, value, section)?,
            };
            id_map.push(idx as u32);
        }

        for (idx, base, patches) in pending {
            for mut patch in patches {
                patch.offset = patch.offset.wrapping_add(base);
                rebase_patch(file, &mut patch, &sect_map, &id_map)?;
                self.sections[idx].patches.push(patch);
            }
        }
        for mut assertion in object.assertions {
            rebase_patch(file, &mut assertion.patch, &sect_map, &id_map)?;
            self.assertions.push(assertion);
        }
        Ok(())
    }

    /// Assign every section an org and bank, walking the config's section
    /// list in order. Fixed-org sections claim their address; floating ones
    /// take the region cursor, aligned.
    fn place(&mut self, config: &Script) -> io::Result<()> {
        for section in &self.sections {
            if !config.sections.contains_key(&section.name) {
                return Err(err(&format!(
                    "section `{}` is not defined in config",
                    section.name
                )));
            }
        }
        let mut cursors: IndexMap<&str, (u32, u32, Option<u32>)> = config
            .memories
            .iter()
            .map(|(name, mem)| (name.as_str(), (mem.start, mem.start + mem.size, mem.bank)))
            .collect();
        for (name, cfg) in &config.sections {
            if cfg.align == 0 {
                return Err(err(&format!(
                    "section `{name}` has an invalid alignment of 0"
                )));
            }
            let Some(idx) = self.sections.iter().position(|s| &s.name == name) else {
                continue;
            };
            let Some((pc, end, bank)) = cursors.get_mut(cfg.load.as_str()) else {
                return Err(err(&format!(
                    "memory `{}` is not defined in config",
                    cfg.load
                )));
            };
            let size = self.sections[idx].data.len() as u32;
            let org = match self.sections[idx].org {
                Some(org) => {
                    if org < *pc || org.wrapping_add(size) > *end {
                        return Err(err(&format!(
                            "no room in memory `{}` for section `{name}` at ${org:04X}",
                            cfg.load
                        )));
                    }
                    org
                }
                None => {
                    let aligned = ((*pc + cfg.align - 1) / cfg.align) * cfg.align;
                    if aligned.wrapping_add(size) > *end {
                        return Err(err(&format!(
                            "no room left in memory `{}` for section `{name}`",
                            cfg.load
                        )));
                    }
                    aligned
                }
            };
            tracing::trace!("placing section \"{name}\" at ${org:04X}");
            let section = &mut self.sections[idx];
            section.org = Some(org);
            if section.bank.is_none() {
                section.bank = Some(bank.unwrap_or(0));
            }
            *pc = org + size;
        }
        Ok(())
    }

    /// Write the image region by region: placed sections in address order,
    /// gaps and (when requested) the remainder padded with the fill byte.
    fn write_rom(&self, config: &Script, out: &mut dyn Write) -> io::Result<()> {
        for (mem_name, memory) in &config.memories {
            let fill = memory.fill.unwrap_or(0);
            let mut placed: Vec<&Section> = self
                .sections
                .iter()
                .filter(|s| {
                    config
                        .sections
                        .get(&s.name)
                        .is_some_and(|cfg| &cfg.load == mem_name)
                })
                .collect();
            placed.sort_by_key(|s| s.org);
            let mut cursor = memory.start;
            for section in placed {
                let org = section
                    .org
                    .ok_or_else(|| err(&format!("section `{}` was never placed", section.name)))?;
                if org > cursor {
                    out.write_all(&vec![fill; (org - cursor) as usize])?;
                }
                tracing::trace!(
                    "writing {} bytes of section \"{}\" in memory \"{mem_name}\"",
                    section.data.len(),
                    section.name
                );
                out.write_all(&section.data)?;
                cursor = org + section.data.len() as u32;
            }
            if memory.fill.is_some() {
                let end = memory.start + memory.size;
                if end > cursor {
                    tracing::trace!(
                        "filling {} bytes of memory \"{mem_name}\" with ${fill:02X}",
                        end - cursor
                    );
                    out.write_all(&vec![fill; (end - cursor) as usize])?;
                }
            }
        }
        Ok(())
    }
}

fn rebase_patch(
    file: &str,
    patch: &mut Patch,
    sect_map: &[(usize, u32)],
    id_map: &[u32],
) -> io::Result<()> {
    // A sectionless patch (a top-level assertion) has no PC to rebase.
    if patch.pc_section != NO_PC_SECTION {
        let &(idx, base) = sect_map
            .get(patch.pc_section)
            .ok_or_else(|| err_in(file, "patch section out of range"))?;
        patch.pc_section = idx;
        patch.pc_offset = patch.pc_offset.wrapping_add(base);
    }
    remap_symbols(&mut patch.rpn, id_map).map_err(|e| err_in(file, e.message()))?;
    Ok(())
}

// ---- object reading ----

trait FromLeBytes: Sized {
    type Buf: Default + AsMut<[u8]>;

    fn from_le_bytes(buf: Self::Buf) -> Self;
}

macro_rules! impl_le_bytes (( $($int:ident),* ) => {
    $(
        impl FromLeBytes for $int {
            type Buf = [u8; std::mem::size_of::<Self>()];

            fn from_le_bytes(buf: Self::Buf) -> Self {
                Self::from_le_bytes(buf)
            }
        }
    )*
});

impl_le_bytes!(u8, u32, i32);

fn read_int<R: Read, T: FromLeBytes>(reader: &mut R) -> io::Result<T> {
    let mut buf = T::Buf::default();
    reader.read_exact(buf.as_mut())?;
    Ok(T::from_le_bytes(buf))
}

fn read_string<R: Read>(file: &str, reader: &mut R) -> io::Result<String> {
    let len: u32 = read_int(reader)?;
    if len as usize > MAX_RPN_LEN {
        return Err(err_in(file, "malformed string"));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| err_in(file, "malformed string"))
}

fn read_patch<R: Read>(file: &str, reader: &mut R) -> io::Result<Patch> {
    let pfile = read_string(file, reader)?;
    let line: u32 = read_int(reader)?;
    let offset: u32 = read_int(reader)?;
    let kind: u8 = read_int(reader)?;
    let kind = PatchKind::from_u8(kind).ok_or_else(|| err_in(file, "malformed patch record"))?;
    let pc_section: u32 = read_int(reader)?;
    let pc_offset: u32 = read_int(reader)?;
    let rpn_len: u32 = read_int(reader)?;
    if rpn_len as usize > MAX_RPN_LEN {
        return Err(err_in(file, "malformed patch record"));
    }
    let mut rpn = vec![0u8; rpn_len as usize];
    reader.read_exact(&mut rpn)?;
    Ok(Patch {
        file: pfile,
        line,
        offset,
        kind,
        pc_section: pc_section as usize,
        pc_offset,
        rpn,
    })
}

fn read_object<R: Read>(file: &str, mut reader: R) -> io::Result<Object> {
    let mut magic = [0u8; 7];
    reader.read_exact(&mut magic)?;
    if &magic != b"gbasm01" {
        return Err(err_in(file, "bad magic"));
    }

    let nsyms: u32 = read_int(&mut reader)?;
    let mut symbols = Vec::with_capacity(nsyms as usize);
    for _ in 0..nsyms {
        let name = read_string(file, &mut reader)?;
        let ty: u8 = read_int(&mut reader)?;
        match ty {
            0 => symbols.push(ObjSymbol {
                name,
                ty,
                section: None,
                value: 0,
            }),
            1 | 2 => {
                let _def_file = read_string(file, &mut reader)?;
                let _def_line: u32 = read_int(&mut reader)?;
                let section: i32 = read_int(&mut reader)?;
                let value: i32 = read_int(&mut reader)?;
                symbols.push(ObjSymbol {
                    name,
                    ty,
                    section: (section >= 0).then_some(section as usize),
                    value,
                });
            }
            _ => return Err(err_in(file, "malformed symbol table")),
        }
    }

    let nsections: u32 = read_int(&mut reader)?;
    let mut sections = Vec::with_capacity(nsections as usize);
    for _ in 0..nsections {
        let name = read_string(file, &mut reader)?;
        let org: i32 = read_int(&mut reader)?;
        let bank: i32 = read_int(&mut reader)?;
        let data_len: u32 = read_int(&mut reader)?;
        let mut data = vec![0u8; data_len as usize];
        reader.read_exact(&mut data)?;
        let npatches: u32 = read_int(&mut reader)?;
        let mut patches = Vec::with_capacity(npatches as usize);
        for _ in 0..npatches {
            patches.push(read_patch(file, &mut reader)?);
        }
        sections.push(ObjSection {
            name,
            org: (org >= 0).then_some(org as u32),
            bank: (bank >= 0).then_some(bank as u32),
            data,
            patches,
        });
    }

    let nassert: u32 = read_int(&mut reader)?;
    let mut assertions = Vec::with_capacity(nassert as usize);
    for _ in 0..nassert {
        let patch = read_patch(file, &mut reader)?;
        let kind: u8 = read_int(&mut reader)?;
        let kind =
            AssertKind::from_u8(kind).ok_or_else(|| err_in(file, "malformed assertion"))?;
        let message = read_string(file, &mut reader)?;
        assertions.push(Assertion {
            patch,
            kind,
            message,
        });
    }

    Ok(Object {
        symbols,
        sections,
        assertions,
    })
}

// ---- config ----

#[derive(Deserialize)]
struct Script {
    #[serde(rename = "MEMORY")]
    memories: IndexMap<String, ConfigMemory>,

    #[serde(rename = "SECTIONS")]
    sections: IndexMap<String, ConfigSection>,
}

#[derive(Deserialize)]
struct ConfigMemory {
    #[serde(deserialize_with = "deserialize_bases_u32")]
    start: u32,

    #[serde(deserialize_with = "deserialize_bases_u32")]
    size: u32,

    #[serde(default, deserialize_with = "deserialize_bases_opt_u32")]
    bank: Option<u32>,

    #[serde(default, deserialize_with = "deserialize_bases_u8")]
    fill: Option<u8>,
}

fn one() -> u32 {
    1
}

#[derive(Deserialize)]
struct ConfigSection {
    load: String,

    #[serde(default = "one", deserialize_with = "deserialize_bases_u32")]
    align: u32,
}

fn parse_based_u32(buf: &str) -> Result<u32, String> {
    if let Some(hex) = buf.strip_prefix('$') {
        u32::from_str_radix(hex, 16)
            .map_err(|e| format!("{buf} is not a valid base 16 value: {e}"))
    } else if let Some(bin) = buf.strip_prefix('%') {
        u32::from_str_radix(bin, 2).map_err(|e| format!("{buf} is not a valid base 2 value: {e}"))
    } else {
        buf.parse()
            .map_err(|e| format!("{buf} is not a valid base 10 value: {e}"))
    }
}

fn deserialize_bases_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    parse_based_u32(&buf).map_err(de::Error::custom)
}

fn deserialize_bases_opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|buf| parse_based_u32(&buf).map_err(de::Error::custom))
        .transpose()
}

fn deserialize_bases_u8<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|buf| {
            let value = parse_based_u32(&buf).map_err(de::Error::custom)?;
            u8::try_from(value)
                .map_err(|_| de::Error::custom(format!("{buf} does not fit in a byte")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbasm::expr::RpnOp;
    use std::io::Cursor;

    fn push_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_i32(out: &mut Vec<u8>, value: i32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_str(out: &mut Vec<u8>, s: &str) {
        push_u32(out, s.len() as u32);
        out.extend_from_slice(s.as_bytes());
    }

    struct SymSpec<'a> {
        name: &'a str,
        ty: u8,
        section: i32,
        value: i32,
    }

    struct PatchSpec {
        offset: u32,
        kind: PatchKind,
        pc_offset: u32,
        rpn: Vec<u8>,
    }

    fn sym_rpn(id: u32) -> Vec<u8> {
        let mut rpn = vec![RpnOp::SYM];
        rpn.extend_from_slice(&id.to_le_bytes());
        rpn
    }

    /// Build a single-section object image the way the assembler writes it.
    fn object(
        syms: &[SymSpec],
        section: &str,
        org: i32,
        data: &[u8],
        patches: &[PatchSpec],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"gbasm01");
        push_u32(&mut out, syms.len() as u32);
        for sym in syms {
            push_str(&mut out, sym.name);
            out.push(sym.ty);
            if sym.ty != 0 {
                push_str(&mut out, "test.asm");
                push_u32(&mut out, 1);
                push_i32(&mut out, sym.section);
                push_i32(&mut out, sym.value);
            }
        }
        push_u32(&mut out, 1);
        push_str(&mut out, section);
        push_i32(&mut out, org);
        push_i32(&mut out, -1);
        push_u32(&mut out, data.len() as u32);
        out.extend_from_slice(data);
        push_u32(&mut out, patches.len() as u32);
        for patch in patches {
            push_str(&mut out, "test.asm");
            push_u32(&mut out, 1);
            push_u32(&mut out, patch.offset);
            out.push(patch.kind.to_u8());
            push_u32(&mut out, 0);
            push_u32(&mut out, patch.pc_offset);
            push_u32(&mut out, patch.rpn.len() as u32);
            out.extend_from_slice(&patch.rpn);
        }
        push_u32(&mut out, 0);
        out
    }

    fn script(toml: &str) -> Script {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut ld = Ld::new();
        let result = ld.load("bad.o", Cursor::new(b"notanobj".to_vec()));
        assert!(result.is_err());
    }

    #[test]
    fn imports_resolve_across_objects() {
        let provider = object(
            &[SymSpec {
                name: "Foo",
                ty: 2,
                section: 0,
                value: 0,
            }],
            "code",
            -1,
            &[0xC9],
            &[],
        );
        let consumer = object(
            &[SymSpec {
                name: "Foo",
                ty: 0,
                section: -1,
                value: 0,
            }],
            "code",
            -1,
            &[0xCD, 0x00, 0x00],
            &[PatchSpec {
                offset: 1,
                kind: PatchKind::Word,
                pc_offset: 1,
                rpn: sym_rpn(0),
            }],
        );
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(provider)).unwrap();
        ld.load("b.o", Cursor::new(consumer)).unwrap();
        // Both objects named the section "code": one merged section, the
        // second object's bytes rebased after the first's.
        assert_eq!(ld.sections.len(), 1);
        assert_eq!(ld.sections[0].data, vec![0xC9, 0xCD, 0x00, 0x00]);
        assert_eq!(ld.sections[0].patches[0].offset, 2);

        let config = script(
            "[MEMORY.rom]\nstart = \"$50\"\nsize = \"$100\"\n\n[SECTIONS.code]\nload = \"rom\"\n",
        );
        ld.place(&config).unwrap();
        assert_eq!(ld.sections[0].org, Some(0x50));

        let mut stack = RpnStack::new();
        apply_patches(&mut ld.sections, &ld.symbols, &mut stack, &mut ld.diag).unwrap();
        assert_eq!(ld.diag.error_count(), 0);
        // `Foo` lives at the section start, $50.
        assert_eq!(ld.sections[0].data, vec![0xC9, 0xCD, 0x50, 0x00]);
    }

    #[test]
    fn duplicate_exports_are_rejected() {
        let a = object(
            &[SymSpec {
                name: "Foo",
                ty: 2,
                section: 0,
                value: 0,
            }],
            "code",
            -1,
            &[0x00],
            &[],
        );
        let b = object(
            &[SymSpec {
                name: "Foo",
                ty: 2,
                section: 0,
                value: 0,
            }],
            "other",
            -1,
            &[0x00],
            &[],
        );
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        assert!(ld.load("b.o", Cursor::new(b)).is_err());
    }

    #[test]
    fn locals_do_not_collide_across_objects() {
        let a = object(
            &[SymSpec {
                name: "loop",
                ty: 1,
                section: 0,
                value: 0,
            }],
            "a",
            -1,
            &[0x00],
            &[],
        );
        let b = object(
            &[SymSpec {
                name: "loop",
                ty: 1,
                section: 0,
                value: 0,
            }],
            "b",
            -1,
            &[0x00],
            &[],
        );
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        ld.load("b.o", Cursor::new(b)).unwrap();
        assert_eq!(ld.symbols.len(), 2);
    }

    #[test]
    fn undefined_import_reports_and_links_sentinel() {
        let obj = object(
            &[SymSpec {
                name: "Nowhere",
                ty: 0,
                section: -1,
                value: 0,
            }],
            "code",
            -1,
            &[0x3E, 0x00],
            &[PatchSpec {
                offset: 1,
                kind: PatchKind::Byte,
                pc_offset: 1,
                rpn: sym_rpn(0),
            }],
        );
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(obj)).unwrap();
        let config = script(
            "[MEMORY.rom]\nstart = \"0\"\nsize = \"$100\"\n\n[SECTIONS.code]\nload = \"rom\"\n",
        );
        ld.place(&config).unwrap();
        let mut stack = RpnStack::new();
        apply_patches(&mut ld.sections, &ld.symbols, &mut stack, &mut ld.diag).unwrap();
        assert_eq!(ld.diag.error_count(), 1);
        assert_eq!(ld.sections[0].data, vec![0x3E, 0x01]);
    }

    #[test]
    fn command_line_defines_satisfy_imports() {
        let obj = object(
            &[SymSpec {
                name: "SPEED",
                ty: 0,
                section: -1,
                value: 0,
            }],
            "code",
            -1,
            &[0x3E, 0x00],
            &[PatchSpec {
                offset: 1,
                kind: PatchKind::Byte,
                pc_offset: 1,
                rpn: sym_rpn(0),
            }],
        );
        let mut ld = Ld::new();
        ld.add_define("SPEED", 7);
        ld.load("a.o", Cursor::new(obj)).unwrap();
        let config = script(
            "[MEMORY.rom]\nstart = \"0\"\nsize = \"$100\"\n\n[SECTIONS.code]\nload = \"rom\"\n",
        );
        ld.place(&config).unwrap();
        let mut stack = RpnStack::new();
        apply_patches(&mut ld.sections, &ld.symbols, &mut stack, &mut ld.diag).unwrap();
        assert_eq!(ld.diag.error_count(), 0);
        assert_eq!(ld.sections[0].data, vec![0x3E, 0x07]);
    }

    #[test]
    fn fixed_org_sections_keep_their_address() {
        let a = object(&[], "header", 0x104, &[0xCE, 0xED], &[]);
        let b = object(&[], "boot", 0x100, &[0x00, 0xC3], &[]);
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        ld.load("b.o", Cursor::new(b)).unwrap();
        let config = script(
            "[MEMORY.rom]\nstart = \"$100\"\nsize = \"$10\"\nfill = \"$FF\"\n\n\
             [SECTIONS.boot]\nload = \"rom\"\n\n[SECTIONS.header]\nload = \"rom\"\n",
        );
        ld.place(&config).unwrap();
        assert_eq!(ld.sections[0].org, Some(0x104));
        assert_eq!(ld.sections[1].org, Some(0x100));

        let mut rom = Vec::new();
        ld.write_rom(&config, &mut rom).unwrap();
        // Sections in address order, the gap and the remainder filled.
        assert_eq!(
            rom,
            vec![
                0x00, 0xC3, 0xFF, 0xFF, 0xCE, 0xED, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
                0xFF, 0xFF, 0xFF
            ]
        );
    }

    #[test]
    fn floating_sections_pack_in_config_order() {
        let a = object(&[], "a", -1, &[1, 2, 3], &[]);
        let b = object(&[], "b", -1, &[4], &[]);
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        ld.load("b.o", Cursor::new(b)).unwrap();
        let config = script(
            "[MEMORY.rom]\nstart = \"0\"\nsize = \"$10\"\n\n\
             [SECTIONS.b]\nload = \"rom\"\n\n[SECTIONS.a]\nload = \"rom\"\nalign = \"4\"\n",
        );
        ld.place(&config).unwrap();
        // `b` is listed first and takes address 0; `a` aligns up to 4.
        assert_eq!(ld.sections[1].org, Some(0));
        assert_eq!(ld.sections[0].org, Some(4));
    }

    #[test]
    fn unknown_section_is_an_error() {
        let a = object(&[], "mystery", -1, &[0], &[]);
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        let config =
            script("[MEMORY.rom]\nstart = \"0\"\nsize = \"$10\"\n\n[SECTIONS.code]\nload = \"rom\"\n");
        assert!(ld.place(&config).is_err());
    }

    #[test]
    fn overfull_memory_is_an_error() {
        let a = object(&[], "code", -1, &[0; 32], &[]);
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(a)).unwrap();
        let config =
            script("[MEMORY.rom]\nstart = \"0\"\nsize = \"$10\"\n\n[SECTIONS.code]\nload = \"rom\"\n");
        assert!(ld.place(&config).is_err());
    }

    #[test]
    fn sectionless_assertions_load_and_check() {
        // A file that never opens a section can still defer an assertion;
        // its patch carries no PC context and nothing to rebase.
        let mut out = Vec::new();
        out.extend_from_slice(b"gbasm01");
        push_u32(&mut out, 1);
        push_str(&mut out, "Val");
        out.push(0);
        push_u32(&mut out, 0);
        push_u32(&mut out, 1);
        push_str(&mut out, "test.asm");
        push_u32(&mut out, 1);
        push_u32(&mut out, 0);
        out.push(PatchKind::Long.to_u8());
        push_u32(&mut out, u32::MAX);
        push_u32(&mut out, 0);
        let rpn = sym_rpn(0);
        push_u32(&mut out, rpn.len() as u32);
        out.extend_from_slice(&rpn);
        out.push(AssertKind::Error.to_u8());
        push_str(&mut out, "val is zero");

        let mut ld = Ld::new();
        ld.add_define("Val", 1);
        ld.load("a.o", Cursor::new(out)).unwrap();
        assert_eq!(ld.assertions[0].patch.pc_section, NO_PC_SECTION);
        let mut stack = RpnStack::new();
        check_assertions(
            &ld.assertions,
            &ld.sections,
            &ld.symbols,
            &mut stack,
            &mut ld.diag,
        )
        .unwrap();
        assert_eq!(ld.diag.error_count(), 0);
    }

    #[test]
    fn pc_patch_uses_section_placement() {
        // `@` in a patch resolves to the operand address under the patch's
        // PC context, so this displacement lands one byte back.
        let mut rpn = sym_rpn(0);
        rpn.push(RpnOp::CONST);
        rpn.extend_from_slice(&0i32.to_le_bytes());
        rpn.push(RpnOp::ADD);
        let obj = object(
            &[SymSpec {
                name: "@",
                ty: 0,
                section: -1,
                value: 0,
            }],
            "code",
            -1,
            &[0x18, 0x00],
            &[PatchSpec {
                offset: 1,
                kind: PatchKind::JrByte,
                pc_offset: 1,
                rpn,
            }],
        );
        let mut ld = Ld::new();
        ld.load("a.o", Cursor::new(obj)).unwrap();
        let config = script(
            "[MEMORY.rom]\nstart = \"$200\"\nsize = \"$100\"\n\n[SECTIONS.code]\nload = \"rom\"\n",
        );
        ld.place(&config).unwrap();
        let mut stack = RpnStack::new();
        apply_patches(&mut ld.sections, &ld.symbols, &mut stack, &mut ld.diag).unwrap();
        assert_eq!(ld.diag.error_count(), 0);
        assert_eq!(ld.sections[0].data, vec![0x18, 0xFF]);
    }
}
