use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator, Tree};

use crate::complexity::ComplexityRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,

    /// 1-based, inclusive.
    pub start_line: u32,
    pub end_line: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSymbols {
    pub path: String,
    pub language: &'static str,
    pub symbols: Vec<Symbol>,
}

/// One symbol kind a driver knows how to find.
///
/// `query` must capture the declaration as `@def` and its name as `@name`.
pub struct SymbolQuery {
    pub kind: &'static str,
    pub query: &'static str,
    pub signature: bool,
}

pub trait LanguageDriver: Send + Sync {
    fn name(&self) -> &'static str;
    /// File extensions handled by this driver (lowercase, without dot).
    fn extensions(&self) -> &'static [&'static str];
    fn language_for_path(&self, path: &Path) -> Language;

    /// Reported language for a path; one grammar may serve several languages.
    fn language_name(&self, _path: &Path) -> &'static str {
        self.name()
    }

    fn symbol_queries(&self) -> &'static [SymbolQuery];
    fn complexity_rules(&self) -> &'static ComplexityRules;
}

pub struct LanguageConfig {
    drivers: Vec<Box<dyn LanguageDriver>>,
    by_ext: HashMap<String, usize>,
}

impl LanguageConfig {
    fn driver_for_path(&self, path: &Path) -> Option<&dyn LanguageDriver> {
        let idx = *self.by_ext.get(&path_ext_lower(path))?;
        self.drivers.get(idx).map(|d| d.as_ref())
    }
}

impl Default for LanguageConfig {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut drivers: Vec<Box<dyn LanguageDriver>> = vec![
            Box::new(RustDriver),
            Box::new(TypeScriptDriver),
            Box::new(PythonDriver),
        ];

        #[cfg(feature = "lang-go")]
        drivers.push(Box::new(GoDriver));

        let mut cfg = Self {
            drivers,
            by_ext: HashMap::new(),
        };
        for (idx, d) in cfg.drivers.iter().enumerate() {
            for ext in d.extensions() {
                cfg.by_ext.insert(ext.to_string(), idx);
            }
        }
        cfg
    }
}

fn language_config() -> &'static LanguageConfig {
    static CFG: OnceLock<LanguageConfig> = OnceLock::new();
    CFG.get_or_init(LanguageConfig::default)
}

fn path_ext_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

pub fn driver_for_path(path: &Path) -> Option<&'static dyn LanguageDriver> {
    language_config().driver_for_path(path)
}

/// Language label for `list_files`; `None` for files no driver handles.
pub fn language_of(path: &Path) -> Option<&'static str> {
    driver_for_path(path).map(|d| d.language_name(path))
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

struct RustDriver;
impl LanguageDriver for RustDriver {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_rust::LANGUAGE.into()
    }

    fn symbol_queries(&self) -> &'static [SymbolQuery] {
        &[
            SymbolQuery {
                kind: "function",
                query: r#"(function_item name: (identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "struct",
                query: r#"(struct_item name: (type_identifier) @name) @def"#,
                signature: false,
            },
            SymbolQuery {
                kind: "enum",
                query: r#"(enum_item name: (type_identifier) @name) @def"#,
                signature: false,
            },
            SymbolQuery {
                kind: "trait",
                query: r#"(trait_item name: (type_identifier) @name) @def"#,
                signature: false,
            },
            SymbolQuery {
                kind: "type",
                query: r#"(type_item name: (type_identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "module",
                query: r#"(mod_item name: (identifier) @name) @def"#,
                signature: false,
            },
        ]
    }

    fn complexity_rules(&self) -> &'static ComplexityRules {
        &ComplexityRules {
            function_kinds: &["function_item"],
            closure_kinds: &["closure_expression"],
            if_kinds: &["if_expression"],
            else_kinds: &["else_clause"],
            elif_kinds: &[],
            branch_kinds: &["for_expression", "while_expression", "loop_expression"],
            switch_kinds: &["match_expression"],
            case_kinds: &["match_arm"],
            logical_kinds: &["binary_expression"],
            logical_ops: &["&&", "||"],
        }
    }
}

struct TypeScriptDriver;
impl LanguageDriver for TypeScriptDriver {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"]
    }

    fn language_for_path(&self, path: &Path) -> Language {
        match path_ext_lower(path).as_str() {
            "ts" | "mts" | "cts" => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            // JSX needs the TSX grammar; plain JS parses fine with it too.
            _ => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }

    fn language_name(&self, path: &Path) -> &'static str {
        match path_ext_lower(path).as_str() {
            "js" | "jsx" | "mjs" | "cjs" => "javascript",
            _ => "typescript",
        }
    }

    fn symbol_queries(&self) -> &'static [SymbolQuery] {
        &[
            SymbolQuery {
                kind: "function",
                query: r#"(function_declaration name: (identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "function",
                query: r#"(lexical_declaration (variable_declarator name: (identifier) @name value: (arrow_function))) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "class",
                query: r#"(class_declaration name: (type_identifier) @name) @def"#,
                signature: false,
            },
            SymbolQuery {
                kind: "method",
                query: r#"(method_definition name: (property_identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "interface",
                query: r#"(interface_declaration name: (type_identifier) @name) @def"#,
                signature: false,
            },
            SymbolQuery {
                kind: "type",
                query: r#"(type_alias_declaration name: (type_identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "enum",
                query: r#"(enum_declaration name: (identifier) @name) @def"#,
                signature: false,
            },
        ]
    }

    fn complexity_rules(&self) -> &'static ComplexityRules {
        &ComplexityRules {
            function_kinds: &[
                "function_declaration",
                "generator_function_declaration",
                "method_definition",
            ],
            closure_kinds: &["arrow_function", "function_expression"],
            if_kinds: &["if_statement"],
            else_kinds: &["else_clause"],
            elif_kinds: &[],
            branch_kinds: &[
                "for_statement",
                "for_in_statement",
                "while_statement",
                "do_statement",
                "catch_clause",
                "ternary_expression",
            ],
            switch_kinds: &["switch_statement"],
            case_kinds: &["switch_case"],
            logical_kinds: &["binary_expression"],
            logical_ops: &["&&", "||", "??"],
        }
    }
}

struct PythonDriver;
impl LanguageDriver for PythonDriver {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_python::LANGUAGE.into()
    }

    fn symbol_queries(&self) -> &'static [SymbolQuery] {
        &[
            SymbolQuery {
                kind: "function",
                query: r#"(function_definition name: (identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "class",
                query: r#"(class_definition name: (identifier) @name) @def"#,
                signature: true,
            },
        ]
    }

    fn complexity_rules(&self) -> &'static ComplexityRules {
        &ComplexityRules {
            function_kinds: &["function_definition"],
            closure_kinds: &["lambda"],
            if_kinds: &["if_statement"],
            else_kinds: &["else_clause"],
            elif_kinds: &["elif_clause"],
            branch_kinds: &[
                "for_statement",
                "while_statement",
                "except_clause",
                "conditional_expression",
                "for_in_clause",
            ],
            switch_kinds: &["match_statement"],
            case_kinds: &["case_clause"],
            logical_kinds: &["boolean_operator"],
            logical_ops: &["and", "or"],
        }
    }
}

#[cfg(feature = "lang-go")]
struct GoDriver;

#[cfg(feature = "lang-go")]
impl LanguageDriver for GoDriver {
    fn name(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn language_for_path(&self, _path: &Path) -> Language {
        tree_sitter_go::LANGUAGE.into()
    }

    fn symbol_queries(&self) -> &'static [SymbolQuery] {
        &[
            SymbolQuery {
                kind: "function",
                query: r#"(function_declaration name: (identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "method",
                query: r#"(method_declaration name: (field_identifier) @name) @def"#,
                signature: true,
            },
            SymbolQuery {
                kind: "type",
                query: r#"(type_spec name: (type_identifier) @name) @def"#,
                signature: false,
            },
        ]
    }

    fn complexity_rules(&self) -> &'static ComplexityRules {
        &ComplexityRules {
            function_kinds: &["function_declaration", "method_declaration"],
            closure_kinds: &["func_literal"],
            // Go's else branch is the `alternative` field itself, no wrapper node.
            if_kinds: &["if_statement"],
            else_kinds: &[],
            elif_kinds: &[],
            branch_kinds: &["for_statement"],
            switch_kinds: &[
                "expression_switch_statement",
                "type_switch_statement",
                "select_statement",
            ],
            case_kinds: &["expression_case", "type_case", "communication_case"],
            logical_kinds: &["binary_expression"],
            logical_ops: &["&&", "||"],
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing + queries
// ---------------------------------------------------------------------------

pub fn parse_source(driver: &dyn LanguageDriver, path: &Path, source_text: &str) -> Result<Tree> {
    let language = driver.language_for_path(path);
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .context("Failed to set tree-sitter language")?;
    parser
        .parse(source_text, None)
        .ok_or_else(|| anyhow!("Failed to parse {}", path.display()))
}

pub(crate) fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

fn first_line_signature(def_text: &str) -> String {
    let mut s = def_text;
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find('\n') {
        s = &s[..i];
    }

    // Collapse whitespace.
    let mut out = String::with_capacity(s.len().min(200));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }

    out.trim().trim_end_matches(':').trim().to_string()
}

fn run_query(source: &[u8], root: Node, language: &Language, sq: &SymbolQuery) -> Result<Vec<Symbol>> {
    let query = Query::new(language, sq.query).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();
    let mut out: Vec<Symbol> = Vec::new();

    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        let mut name_node: Option<Node> = None;
        let mut def_node: Option<Node> = None;

        for cap in m.captures {
            match query.capture_names()[cap.index as usize] {
                "name" => name_node = Some(cap.node),
                "def" => def_node = Some(cap.node),
                _ => {}
            }
        }

        let Some(name_node) = name_node else { continue };
        let def_node = def_node.unwrap_or(name_node);

        let name = node_text(source, name_node).trim().to_string();
        if name.is_empty() {
            continue;
        }

        let signature = sq
            .signature
            .then(|| first_line_signature(node_text(source, def_node)))
            .filter(|s| !s.is_empty());

        out.push(Symbol {
            name,
            kind: sq.kind.to_string(),
            start_line: def_node.start_position().row as u32 + 1,
            end_line: def_node.end_position().row as u32 + 1,
            signature,
        });
    }

    Ok(out)
}

/// Symbols in `source_text`, ordered by line then name.
pub fn extract_symbols(driver: &dyn LanguageDriver, path: &Path, source_text: &str) -> Result<Vec<Symbol>> {
    let tree = parse_source(driver, path, source_text)?;
    let language = driver.language_for_path(path);
    let source = source_text.as_bytes();

    let mut symbols: Vec<Symbol> = Vec::new();
    for sq in driver.symbol_queries() {
        symbols.extend(run_query(source, tree.root_node(), &language, sq)?);
    }

    symbols.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    symbols.dedup_by(|a, b| a.start_line == b.start_line && a.name == b.name && a.kind == b.kind);
    Ok(symbols)
}

/// Read a file from disk and extract its symbols (CLI entry point).
pub fn analyze_file(path: &Path) -> Result<FileSymbols> {
    let driver = driver_for_path(path).ok_or_else(|| anyhow!("Unsupported file extension: {}", path.display()))?;
    let source_text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(FileSymbols {
        path: path.to_string_lossy().replace('\\', "/"),
        language: driver.language_name(path),
        symbols: extract_symbols(driver, path, &source_text)?,
    })
}
