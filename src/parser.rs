//! Heuristic source parsing — split files into typed retrieval nodes.
//!
//! No real grammars: brace balance for the brace family, indentation for
//! the Python family, whole-file nodes for everything else. The same
//! machinery backs `validate`, the syntax gate used before journaled
//! writes.

use crate::types::{CodeNode, NodeKind};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Language family classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFamily {
    BraceBased,
    IndentBased,
    Unknown,
}

pub fn classify_language(ext: &str) -> LanguageFamily {
    match ext {
        "h" | "hpp" | "hxx" | "cpp" | "cxx" | "cc" | "c" | "cs" | "java" | "kt" | "scala"
        | "rs" | "go" | "js" | "ts" | "jsx" | "tsx" | "mjs" | "cjs" | "swift" | "d" => {
            LanguageFamily::BraceBased
        }
        "py" | "rb" => LanguageFamily::IndentBased,
        _ => LanguageFamily::Unknown,
    }
}

/// Extension (lowercased, no dot) of a path, for family lookup.
pub fn language_of_path(path: &str) -> String {
    path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Node extraction
// ---------------------------------------------------------------------------

/// Extract the file-level node plus class/function nodes from one source
/// file. Blank files yield nothing; every returned node has non-empty
/// content and a literal line span.
pub fn extract(file_path: &str, content: &str) -> Vec<CodeNode> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
    let line_count = content.lines().count().max(1);
    let mut nodes = vec![CodeNode {
        id: CodeNode::make_id(file_path, file_path),
        name: file_name.to_string(),
        kind: NodeKind::File,
        file_path: file_path.to_string(),
        content: content.to_string(),
        docstring: leading_comment(content),
        start_line: 1,
        end_line: line_count,
        dependencies: BTreeSet::new(),
        embedding: Vec::new(),
        weights: BTreeMap::new(),
    }];

    match classify_language(&language_of_path(file_path)) {
        LanguageFamily::BraceBased => extract_brace_symbols(file_path, content, &mut nodes),
        LanguageFamily::IndentBased => extract_indent_symbols(file_path, content, &mut nodes),
        LanguageFamily::Unknown => {}
    }

    // A struct and its impl block produce the same qualified name; the
    // first span (the type definition) wins.
    let mut seen = BTreeSet::new();
    nodes.retain(|n| !n.content.trim().is_empty() && seen.insert(n.id.clone()));
    nodes
}

/// A definition recognized at the start of a line.
struct Definition {
    kind: NodeKind,
    name: String,
}

/// Leading modifiers stripped before keyword matching.
const MODIFIERS: [&str; 16] = [
    "pub", "public", "private", "protected", "static", "async", "export", "default", "abstract",
    "final", "virtual", "inline", "constexpr", "unsafe", "override", "extern",
];

fn strip_modifiers(line: &str) -> &str {
    let mut rest = line.trim_start();
    loop {
        // `pub(crate)` and friends
        if rest.starts_with("pub(") {
            if let Some(close) = rest.find(')') {
                rest = rest[close + 1..].trim_start();
                continue;
            }
        }
        let mut stripped = false;
        for modifier in MODIFIERS {
            if let Some(after) = rest.strip_prefix(modifier) {
                if after.starts_with(' ') || after.starts_with('\t') {
                    rest = after.trim_start();
                    stripped = true;
                    break;
                }
            }
        }
        if !stripped {
            return rest;
        }
    }
}

fn identifier_at(s: &str) -> String {
    s.chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Recognize a class- or function-like definition on one line.
fn recognize_definition(line: &str) -> Option<Definition> {
    let rest = strip_modifiers(line);

    for keyword in ["class", "struct", "interface", "trait", "enum", "namespace", "impl", "object"]
    {
        if let Some(after) = rest.strip_prefix(keyword) {
            if after.starts_with(' ') || after.starts_with('\t') {
                let name = identifier_at(after.trim_start());
                if !name.is_empty() {
                    return Some(Definition { kind: NodeKind::Class, name });
                }
            }
        }
    }

    for keyword in ["fn", "func", "function", "def"] {
        if let Some(after) = rest.strip_prefix(keyword) {
            if after.starts_with(' ') || after.starts_with('\t') {
                let name = identifier_at(after.trim_start());
                if !name.is_empty() && rest.contains('(') {
                    return Some(Definition { kind: NodeKind::Function, name });
                }
            }
        }
    }

    None
}

/// C-family function without a definition keyword: `Type name(args) {`,
/// or the same signature with the brace on a following line. The
/// identifier directly before the parenthesis names the node.
fn recognize_c_style_function(line: &str) -> Option<Definition> {
    let trimmed = line.trim();
    if trimmed.starts_with("//")
        || trimmed.starts_with('#')
        || trimmed.starts_with('*')
        || trimmed.starts_with("if ")
        || trimmed.starts_with("for ")
        || trimmed.starts_with("while ")
        || trimmed.starts_with("switch ")
        || trimmed.starts_with("return ")
        || trimmed.starts_with("else")
        || trimmed.starts_with("} ")
    {
        return None;
    }
    let paren = trimmed.find('(')?;
    // Same-line brace, or a bare signature whose body opens below.
    if !trimmed.contains('{') && !trimmed.ends_with(')') {
        return None;
    }
    let before = trimmed[..paren].trim_end();
    // `x = f(y)` is a call site, not a definition.
    if before.contains('=') {
        return None;
    }
    let name_start = before.rfind([' ', '\t', '*', '&', ':', '>'])?;
    let name = identifier_at(&before[name_start + 1..]);
    if name.is_empty() || !before[..name_start].trim().chars().next()?.is_alphabetic() {
        return None;
    }
    Some(Definition { kind: NodeKind::Function, name })
}

/// Walk a brace-family file, emitting a node per top-level (and one level
/// nested, for methods inside a class) definition. Spans come from brace
/// balance, the docstring from the comment block directly above.
fn extract_brace_symbols(file_path: &str, content: &str, nodes: &mut Vec<CodeNode>) {
    let syntax = line_syntax(&language_of_path(file_path));
    let lines: Vec<&str> = content.lines().collect();
    let mut depth: i32 = 0;
    let mut enclosing_class: Vec<(String, i32)> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        // Pop classes whose scope closed before this line.
        enclosing_class.retain(|(_, open_depth)| depth > *open_depth);

        let definition = recognize_definition(trimmed)
            .or_else(|| if depth <= 1 { recognize_c_style_function(trimmed) } else { None });

        let depth_ok = depth == 0 || (depth == 1 && !enclosing_class.is_empty());
        if let (Some(def), true) = (definition, depth_ok) {
            let (end, next_depth) = brace_span(&lines, i, depth, syntax);
            let span_text = lines[i..=end].join("\n");
            let qualified = match (&def.kind, enclosing_class.last()) {
                (NodeKind::Function, Some((class_name, _))) => {
                    format!("{class_name}.{}", def.name)
                }
                _ => def.name.clone(),
            };
            nodes.push(CodeNode {
                id: CodeNode::make_id(file_path, &qualified),
                name: qualified,
                kind: def.kind,
                file_path: file_path.to_string(),
                content: span_text,
                docstring: comment_above(&lines, i),
                start_line: i + 1,
                end_line: end + 1,
                dependencies: BTreeSet::new(),
                embedding: Vec::new(),
                weights: BTreeMap::new(),
            });

            if def.kind == NodeKind::Class {
                // Descend just past the opening brace so the class's
                // methods become nodes too. A body-less prototype is
                // skipped whole.
                let mut j = i;
                let mut inside = depth;
                let mut opened = false;
                while j <= end {
                    inside += brace_delta(lines[j], syntax);
                    j += 1;
                    if inside > depth {
                        opened = true;
                        break;
                    }
                }
                if opened {
                    enclosing_class.push((def.name, depth));
                    depth = inside;
                    i = j;
                } else {
                    depth = next_depth;
                    i = end + 1;
                }
            } else {
                depth = next_depth;
                i = end + 1;
            }
            continue;
        }

        depth += brace_delta(line, syntax);
        i += 1;
    }
}

/// Line-level lexical rules of the language at hand, just enough to keep
/// strings, char literals, and comments from confusing brace counting.
#[derive(Clone, Copy)]
struct LineSyntax {
    /// `'...'` is a string (Python, Ruby, JS). When false, `'x'` is a
    /// char literal and a lone `'` (a Rust lifetime) is ignored.
    single_quote_strings: bool,
    /// `#` starts a comment.
    hash_comments: bool,
    /// `//` starts a comment. Off for Python, where it is floor division.
    slash_comments: bool,
}

fn line_syntax(ext: &str) -> LineSyntax {
    match ext {
        "py" | "rb" => LineSyntax {
            single_quote_strings: true,
            hash_comments: true,
            slash_comments: false,
        },
        "js" | "ts" | "jsx" | "tsx" | "mjs" | "cjs" => LineSyntax {
            single_quote_strings: true,
            hash_comments: false,
            slash_comments: true,
        },
        _ => LineSyntax {
            single_quote_strings: false,
            hash_comments: false,
            slash_comments: true,
        },
    }
}

/// Walk one line's bytes, invoking `f` only for characters outside string
/// literals, char literals, and line comments.
fn scan_structural(line: &str, syntax: LineSyntax, mut f: impl FnMut(u8)) {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if syntax.slash_comments && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                return;
            }
            b'#' if syntax.hash_comments => return,
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'\'' => {
                if syntax.single_quote_strings {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'\'' {
                        if bytes[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                } else if i + 2 < bytes.len() && bytes[i + 1] != b'\\' && bytes[i + 2] == b'\'' {
                    i += 2;
                } else if i + 3 < bytes.len() && bytes[i + 1] == b'\\' && bytes[i + 3] == b'\'' {
                    i += 3;
                }
                // Otherwise a lifetime or stray quote: fall through.
            }
            b => f(b),
        }
        i += 1;
    }
}

/// Net brace delta of one line, ignoring braces inside strings, char
/// literals, and line comments.
fn brace_delta(line: &str, syntax: LineSyntax) -> i32 {
    let mut delta = 0;
    scan_structural(line, syntax, |b| match b {
        b'{' => delta += 1,
        b'}' => delta -= 1,
        _ => {}
    });
    delta
}

/// Find the line index closing the scope opened at `start`, plus the
/// depth after it. A body that opens and closes on one line spans that
/// line; a `;`-terminated prototype or a signature whose brace never
/// opens spans just its own line.
fn brace_span(lines: &[&str], start: usize, base_depth: i32, syntax: LineSyntax) -> (usize, i32) {
    let mut depth = base_depth;
    let mut opened = false;
    for (offset, line) in lines[start..].iter().enumerate() {
        let mut delta = 0;
        scan_structural(line, syntax, |b| match b {
            b'{' => {
                delta += 1;
                opened = true;
            }
            b'}' => delta -= 1,
            _ => {}
        });
        depth += delta;
        if opened && depth <= base_depth {
            return (start + offset, depth);
        }
        if !opened && line.trim_end().ends_with(';') {
            return (start + offset, depth);
        }
        // Signature never opened a body within a reasonable window.
        if !opened && offset > 4 {
            return (start, base_depth);
        }
    }
    (lines.len() - 1, depth)
}

/// Contiguous comment block directly above line `idx`, joined and cleaned
/// of comment markers.
fn comment_above(lines: &[&str], idx: usize) -> String {
    let mut collected: Vec<&str> = Vec::new();
    let mut j = idx;
    while j > 0 {
        let t = lines[j - 1].trim();
        let is_comment = t.starts_with("//")
            || t.starts_with('#') && !t.starts_with("#[")
            || t.starts_with('*')
            || t.starts_with("/*")
            || t.ends_with("*/");
        if is_comment {
            collected.push(t);
            j -= 1;
        } else {
            break;
        }
    }
    collected.reverse();
    collected
        .iter()
        .map(|t| {
            t.trim_start_matches('/')
                .trim_start_matches('*')
                .trim_start_matches('#')
                .trim_start_matches('!')
                .trim_end_matches("*/")
                .trim()
        })
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Leading comment block of a whole file (its "docstring").
fn leading_comment(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut end = 0;
    for line in &lines {
        let t = line.trim();
        if t.starts_with("//")
            || t.starts_with('#') && !t.starts_with("#[")
            || t.starts_with("/*")
            || t.starts_with('*')
            || t.starts_with("\"\"\"")
        {
            end += 1;
        } else {
            break;
        }
    }
    if end == 0 {
        return String::new();
    }
    comment_above(&lines, end)
}

/// Indent-family extraction: `class`/`def` headers open spans that run
/// until the first non-blank line at the same or lower indentation.
fn extract_indent_symbols(file_path: &str, content: &str, nodes: &mut Vec<CodeNode>) {
    let lines: Vec<&str> = content.lines().collect();
    let mut enclosing_class: Option<(String, usize)> = None;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        let indent = line.len() - line.trim_start().len();

        if let Some((_, class_indent)) = enclosing_class {
            if !trimmed.is_empty() && indent <= class_indent {
                enclosing_class = None;
            }
        }

        let (kind, name) = if let Some(after) = trimmed.strip_prefix("class ") {
            (NodeKind::Class, identifier_at(after))
        } else if let Some(after) = trimmed.strip_prefix("def ") {
            (NodeKind::Function, identifier_at(after))
        } else if let Some(after) = trimmed.strip_prefix("async def ") {
            (NodeKind::Function, identifier_at(after))
        } else {
            i += 1;
            continue;
        };

        if name.is_empty() || indent > 8 {
            i += 1;
            continue;
        }

        let end = indent_span(&lines, i, indent);
        let span_text = lines[i..=end].join("\n");
        let qualified = match (&kind, &enclosing_class) {
            (NodeKind::Function, Some((class_name, class_indent))) if indent > *class_indent => {
                format!("{class_name}.{name}")
            }
            _ => name.clone(),
        };
        nodes.push(CodeNode {
            id: CodeNode::make_id(file_path, &qualified),
            name: qualified,
            kind,
            file_path: file_path.to_string(),
            content: span_text,
            docstring: python_docstring(&lines, i, end),
            start_line: i + 1,
            end_line: end + 1,
            dependencies: BTreeSet::new(),
            embedding: Vec::new(),
            weights: BTreeMap::new(),
        });

        if kind == NodeKind::Class {
            enclosing_class = Some((name, indent));
            i += 1;
        } else {
            i = end + 1;
        }
    }
}

/// Last line of an indentation-scoped block opened at `start`.
fn indent_span(lines: &[&str], start: usize, indent: usize) -> usize {
    let mut end = start;
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let line_indent = line.len() - line.trim_start().len();
        if line_indent <= indent {
            break;
        }
        end = start + 1 + offset;
    }
    end
}

/// Triple-quoted docstring directly inside a def/class block.
fn python_docstring(lines: &[&str], start: usize, end: usize) -> String {
    for line in lines[start + 1..=end.min(lines.len() - 1)].iter() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        for quote in ["\"\"\"", "'''"] {
            if let Some(rest) = t.strip_prefix(quote) {
                if let Some(inner) = rest.strip_suffix(quote) {
                    return inner.trim().to_string();
                }
                return rest.trim().to_string();
            }
        }
        break;
    }
    String::new()
}

// ---------------------------------------------------------------------------
// Validation — syntax gate for journaled writes
// ---------------------------------------------------------------------------

/// Minimum content length accepted by the validator (empty-file guard).
const MIN_VALID_LEN: usize = 10;

/// Whether `content` plausibly parses for the given language (by
/// extension). Unknown languages only get the length guard; known
/// families additionally require balanced delimiters, and the indent
/// family rejects a dangling block header at EOF.
pub fn validate(content: &str, language: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.len() < MIN_VALID_LEN {
        return false;
    }
    let syntax = line_syntax(language);
    match classify_language(language) {
        LanguageFamily::BraceBased => delimiters_balanced(content, syntax),
        LanguageFamily::IndentBased => {
            if !delimiters_balanced(content, syntax) {
                return false;
            }
            let last = trimmed.lines().last().unwrap_or("").trim();
            !last.ends_with(':')
        }
        LanguageFamily::Unknown => true,
    }
}

/// Balanced `{} () []` outside strings and line comments. Block comments
/// are not tracked; unbalanced delimiters inside them are rare enough in
/// generated code that the cheap scan wins.
fn delimiters_balanced(content: &str, syntax: LineSyntax) -> bool {
    let mut braces: i64 = 0;
    let mut parens: i64 = 0;
    let mut brackets: i64 = 0;
    let mut underflow = false;
    for line in content.lines() {
        scan_structural(line, syntax, |b| {
            match b {
                b'{' => braces += 1,
                b'}' => braces -= 1,
                b'(' => parens += 1,
                b')' => parens -= 1,
                b'[' => brackets += 1,
                b']' => brackets -= 1,
                _ => {}
            }
            if braces < 0 || parens < 0 || brackets < 0 {
                underflow = true;
            }
        });
        if underflow {
            return false;
        }
    }
    braces == 0 && parens == 0 && brackets == 0
}
