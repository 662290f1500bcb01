//! Function/class boundary detection via tree-sitter.
//!
//! Used to snap context windows outward so the reviewer sees whole
//! definitions instead of windows cut mid-function. Tree-sitter is
//! error-tolerant, so partial parses still yield usable boundaries.

use tree_sitter::{Node, Parser};
use vigil_core::Language;

fn tree_sitter_language(language: Language) -> tree_sitter::Language {
    match language {
        Language::Python => tree_sitter_python::LANGUAGE.into(),
        Language::Javascript => tree_sitter_javascript::LANGUAGE.into(),
        Language::Typescript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    }
}

fn is_boundary_kind(language: Language, kind: &str) -> bool {
    match language {
        Language::Python => matches!(kind, "function_definition" | "class_definition"),
        Language::Javascript | Language::Typescript => matches!(
            kind,
            "function_declaration"
                | "generator_function_declaration"
                | "method_definition"
                | "class_declaration"
                | "function_expression"
                | "arrow_function"
        ),
    }
}

/// Find the smallest enclosing function/class span for a 1-indexed line
/// range, as `(first_line, last_line)`.
///
/// Returns `None` when the range sits outside any definition (module-level
/// code) or the content cannot be parsed.
///
/// # Examples
///
/// ```
/// use vigil_context::enclosing_span;
/// use vigil_core::Language;
///
/// let source = "def outer():\n    a = 1\n    b = 2\n    return a + b\n";
/// assert_eq!(enclosing_span(source, Language::Python, 3, 3), Some((1, 4)));
/// assert_eq!(enclosing_span("x = 1\n", Language::Python, 1, 1), None);
/// ```
pub fn enclosing_span(
    content: &str,
    language: Language,
    line_start: u32,
    line_end: u32,
) -> Option<(u32, u32)> {
    let mut parser = Parser::new();
    parser.set_language(&tree_sitter_language(language)).ok()?;
    let tree = parser.parse(content, None)?;

    // tree-sitter rows are 0-indexed
    let row_start = line_start.saturating_sub(1) as usize;
    let row_end = line_end.saturating_sub(1) as usize;

    let mut best: Option<(usize, usize)> = None;
    find_enclosing(tree.root_node(), language, row_start, row_end, &mut best);
    best.map(|(start, end)| (start as u32 + 1, end as u32 + 1))
}

fn find_enclosing(
    node: Node,
    language: Language,
    row_start: usize,
    row_end: usize,
    best: &mut Option<(usize, usize)>,
) {
    let node_start = node.start_position().row;
    let node_end = node.end_position().row;
    if node_start > row_start || node_end < row_end {
        return;
    }

    if is_boundary_kind(language, node.kind()) {
        // Deeper nodes always span fewer rows, so the last hit wins.
        *best = Some((node_start, node_end));
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        find_enclosing(child, language, row_start, row_end, best);
    }
}
