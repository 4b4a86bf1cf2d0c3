use std::{error::Error, str::FromStr};

pub mod diag;
pub mod expr;
pub mod lexer;
pub mod patch;
pub mod symbol;

/// A chunk of output being assembled or linked, along with the patches that
/// still need link-time values written into it.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// Load address, once fixed. A floating section gets one at link time.
    pub org: Option<u32>,
    /// Bank number, once fixed.
    pub bank: Option<u32>,
    pub data: Vec<u8>,
    pub patches: Vec<patch::Patch>,
}

impl Section {
    pub fn new(name: String, org: Option<u32>, bank: Option<u32>) -> Self {
        Self {
            name,
            org,
            bank,
            data: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Offset the next emitted byte would land at.
    pub fn pc_offset(&self) -> u32 {
        self.data.len() as u32
    }
}

pub fn parse_defines<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid SYMBOL=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}
