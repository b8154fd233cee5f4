//! Line-based symbol extraction for the `functions.json` registry.
//!
//! This is a pattern matcher, not a parser: it recognises declaration keywords at the start of a line in the common
//! shapes used by JavaScript/TypeScript, Rust and Python sources. Declarations split across lines, or nested inside
//! expressions, are not seen.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<export>export\s+(?:default\s+)?|pub(?:\([^)]*\))?\s+)?(?P<async>async\s+)?(?P<kw>function\*?|fn|def|class|struct|interface|trait|type|enum)\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)",
    )
    .expect("INVARIANT: constant declaration regex compiles")
});

static ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<export>export\s+)?(?:const|let|var)\s+(?P<name>[A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(?P<async>async\s+)?(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=>",
    )
    .expect("INVARIANT: constant arrow regex compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Interface,
    Type,
    Enum,
}

impl SymbolKind {
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "function" | "function*" | "fn" | "def" => SymbolKind::Function,
            "class" | "struct" => SymbolKind::Class,
            "interface" | "trait" => SymbolKind::Interface,
            "type" => SymbolKind::Type,
            "enum" => SymbolKind::Enum,
            _ => return None,
        })
    }
}

/// One declaration found in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SymbolKind,
    pub file: String,
    pub exported: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    /// 1-based.
    pub line: usize,
}

/// Extract declarations from `source`, attributing them to `file`.
pub fn extract_symbols(file: &str, source: &str) -> Vec<Symbol> {
    source
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let (caps, kind) = if let Some(caps) = DECLARATION.captures(line) {
                let kind = SymbolKind::from_keyword(caps.name("kw")?.as_str())?;
                (caps, kind)
            } else {
                (ARROW.captures(line)?, SymbolKind::Function)
            };
            Some(Symbol {
                name: caps.name("name")?.as_str().to_string(),
                kind,
                file: file.to_string(),
                exported: caps.name("export").is_some(),
                is_async: caps.name("async").is_some(),
                line: index + 1,
            })
        })
        .collect()
}
