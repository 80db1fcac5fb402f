//! Cyclomatic and cognitive complexity over a tree-sitter syntax tree.
//!
//! Cyclomatic: 1 + decision points (branches, loops, cases, `&&`/`||` chains).
//! Cognitive: structural increments weighted by nesting depth; `else`/`elif`
//! and runs of one logical operator cost a flat +1. Nested named functions
//! are scored on their own and excluded from the enclosing function.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::Path;
use tree_sitter::Node;

use crate::inspector::{driver_for_path, node_text, parse_source, LanguageDriver};

/// Node kinds that drive scoring for one grammar.
pub struct ComplexityRules {
    pub function_kinds: &'static [&'static str],
    /// Anonymous functions: add nesting, no increment of their own.
    pub closure_kinds: &'static [&'static str],
    pub if_kinds: &'static [&'static str],
    pub else_kinds: &'static [&'static str],
    pub elif_kinds: &'static [&'static str],
    /// Loops, catch clauses and conditional expressions.
    pub branch_kinds: &'static [&'static str],
    pub switch_kinds: &'static [&'static str],
    pub case_kinds: &'static [&'static str],
    pub logical_kinds: &'static [&'static str],
    pub logical_ops: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionComplexity {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub cyclomatic_complexity: u32,
    pub cognitive_complexity: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileComplexity {
    pub path: String,
    pub language: &'static str,
    pub lines_of_code: u32,
    pub cyclomatic_complexity: u32,
    pub cognitive_complexity: u32,
    pub functions: Vec<FunctionComplexity>,
}

struct Walker<'a> {
    rules: &'a ComplexityRules,
    source: &'a [u8],
    /// File totals walk through function bodies; per-function scores stop at them.
    descend_functions: bool,
    decisions: u32,
    cognitive: u32,
}

impl<'a> Walker<'a> {
    fn new(rules: &'a ComplexityRules, source: &'a [u8], descend_functions: bool) -> Self {
        Self {
            rules,
            source,
            descend_functions,
            decisions: 0,
            cognitive: 0,
        }
    }

    fn children(&mut self, node: Node, nesting: u32) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.visit(child, nesting);
        }
    }

    fn visit(&mut self, node: Node, nesting: u32) {
        let r = self.rules;
        let kind = node.kind();

        if r.function_kinds.contains(&kind) {
            if self.descend_functions {
                self.children(node, 0);
            }
        } else if r.closure_kinds.contains(&kind) {
            self.children(node, nesting + 1);
        } else if r.if_kinds.contains(&kind) {
            self.visit_if(node, nesting);
        } else if r.elif_kinds.contains(&kind) {
            self.decisions += 1;
            self.cognitive += 1;
            self.children(node, nesting + 1);
        } else if r.else_kinds.contains(&kind) {
            if has_child_of_kind(node, r.if_kinds) {
                // `else if`: the inner `if` scores itself.
                self.children(node, nesting);
            } else {
                self.cognitive += 1;
                self.children(node, nesting + 1);
            }
        } else if r.branch_kinds.contains(&kind) {
            self.decisions += 1;
            self.cognitive += 1 + nesting;
            self.children(node, nesting + 1);
        } else if r.switch_kinds.contains(&kind) {
            self.cognitive += 1 + nesting;
            self.children(node, nesting + 1);
        } else if r.case_kinds.contains(&kind) {
            self.decisions += 1;
            self.children(node, nesting);
        } else if let Some(op) = self.logical_op(node) {
            self.decisions += 1;
            let continues_run = node
                .parent()
                .and_then(|p| self.logical_op(p))
                .is_some_and(|parent_op| parent_op == op);
            if !continues_run {
                self.cognitive += 1;
            }
            self.children(node, nesting);
        } else {
            self.children(node, nesting);
        }
    }

    fn visit_if(&mut self, node: Node, nesting: u32) {
        let r = self.rules;
        self.decisions += 1;
        self.cognitive += if is_else_if(node, r) { 1 } else { 1 + nesting };

        let mut cursor = node.walk();
        for (i, child) in node.children(&mut cursor).enumerate() {
            let ck = child.kind();
            let is_alternative = node.field_name_for_child(i as u32) == Some("alternative")
                || r.else_kinds.contains(&ck)
                || r.elif_kinds.contains(&ck);

            if !is_alternative {
                self.visit(child, nesting + 1);
            } else if r.else_kinds.contains(&ck) || r.elif_kinds.contains(&ck) || r.if_kinds.contains(&ck) {
                self.visit(child, nesting);
            } else {
                // Bare else block (Go).
                self.cognitive += 1;
                self.visit(child, nesting + 1);
            }
        }
    }

    fn logical_op(&self, node: Node) -> Option<&'a str> {
        if !self.rules.logical_kinds.contains(&node.kind()) {
            return None;
        }
        let op = node.child_by_field_name("operator")?;
        let text = node_text(self.source, op);
        self.rules.logical_ops.iter().copied().find(|o| *o == text)
    }
}

fn has_child_of_kind(node: Node, kinds: &[&str]) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| kinds.contains(&c.kind()));
    found
}

fn is_else_if(node: Node, rules: &ComplexityRules) -> bool {
    node.parent().is_some_and(|p| {
        rules.else_kinds.contains(&p.kind()) || rules.if_kinds.contains(&p.kind())
    })
}

fn collect_functions<'t>(node: Node<'t>, kinds: &[&str], out: &mut Vec<Node<'t>>) {
    if kinds.contains(&node.kind()) {
        out.push(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_functions(child, kinds, out);
    }
}

fn lines_of_code(source_text: &str) -> u32 {
    source_text.lines().filter(|l| !l.trim().is_empty()).count() as u32
}

pub fn analyze_source(driver: &dyn LanguageDriver, path: &Path, source_text: &str) -> Result<FileComplexity> {
    let tree = parse_source(driver, path, source_text)?;
    let rules = driver.complexity_rules();
    let source = source_text.as_bytes();
    let root = tree.root_node();

    let mut fn_nodes = Vec::new();
    collect_functions(root, rules.function_kinds, &mut fn_nodes);

    let functions = fn_nodes
        .into_iter()
        .map(|f| {
            let mut w = Walker::new(rules, source, false);
            w.children(f, 0);
            let name = f
                .child_by_field_name("name")
                .map(|n| node_text(source, n).to_string())
                .unwrap_or_else(|| "<anonymous>".to_string());
            FunctionComplexity {
                name,
                start_line: f.start_position().row as u32 + 1,
                end_line: f.end_position().row as u32 + 1,
                cyclomatic_complexity: 1 + w.decisions,
                cognitive_complexity: w.cognitive,
            }
        })
        .collect();

    let mut whole = Walker::new(rules, source, true);
    whole.children(root, 0);

    Ok(FileComplexity {
        path: path.to_string_lossy().replace('\\', "/"),
        language: driver.language_name(path),
        lines_of_code: lines_of_code(source_text),
        cyclomatic_complexity: 1 + whole.decisions,
        cognitive_complexity: whole.cognitive,
        functions,
    })
}

/// Read a file from disk and score it (CLI entry point).
pub fn analyze_file(path: &Path) -> Result<FileComplexity> {
    let driver = driver_for_path(path).ok_or_else(|| anyhow!("Unsupported file extension: {}", path.display()))?;
    let source_text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    analyze_source(driver, path, &source_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(file: &str, src: &str) -> FileComplexity {
        let path = Path::new(file);
        analyze_source(driver_for_path(path).unwrap(), path, src).unwrap()
    }

    #[test]
    fn python_nesting_and_chains() {
        let src = r#"
def classify(n):
    if n < 0:
        return "neg"
    elif n == 0:
        return "zero"
    else:
        for i in range(n):
            if i > 10 and n > 5:
                return "big"
        return "pos"


def identity(x):
    return x
"#;
        let fc = score("classify.py", src);
        assert_eq!(fc.language, "python");
        assert_eq!(fc.lines_of_code, 12);
        assert_eq!(fc.functions.len(), 2);

        let classify = &fc.functions[0];
        assert_eq!(classify.name, "classify");
        assert_eq!((classify.start_line, classify.end_line), (2, 11));
        // if, elif, for, nested if, `and`
        assert_eq!(classify.cyclomatic_complexity, 6);
        // if 1 + elif 1 + else 1 + for 2 + nested if 3 + `and` 1
        assert_eq!(classify.cognitive_complexity, 9);

        let identity = &fc.functions[1];
        assert_eq!((identity.cyclomatic_complexity, identity.cognitive_complexity), (1, 0));

        assert_eq!(fc.cyclomatic_complexity, 6);
        assert_eq!(fc.cognitive_complexity, 9);
    }

    #[test]
    fn rust_else_if_and_match() {
        let src = r#"fn pick(x: i32, flag: bool) -> i32 {
    if x > 0 && flag {
        1
    } else if x < 0 {
        match x {
            -1 => 2,
            _ => 3,
        }
    } else {
        0
    }
}
"#;
        let fc = score("pick.rs", src);
        let pick = &fc.functions[0];
        assert_eq!(pick.name, "pick");
        // if, &&, else if, two arms
        assert_eq!(pick.cyclomatic_complexity, 6);
        // if 1 + && 1 + else if 1 + match 2 + else 1
        assert_eq!(pick.cognitive_complexity, 6);
    }

    #[test]
    fn nested_functions_score_separately() {
        let src = "function outer(a) {\n  function inner(b) {\n    if (b) { return 1; }\n    return 0;\n  }\n  return a ? inner(a) : 0;\n}\n";
        let fc = score("nested.js", src);
        let names: Vec<_> = fc.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(fc.functions[0].cyclomatic_complexity, 2);
        assert_eq!(fc.functions[1].cyclomatic_complexity, 2);
        assert_eq!(fc.cyclomatic_complexity, 3);
    }
}
