//! Debug-info metadata, parsed just deep enough to format sites.
//!
//! Specialized metadata lines (`!N = !DILocation(...)`) are parsed into a
//! node map. Site formatting needs `DILocation` line/column plus the file
//! name reached through the scope chain; the instrumentation filter needs
//! the `DISubprogram` file path. Everything else stays opaque.

use rustc_hash::FxHashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaValue {
    Num(i64),
    Str(String),
    Ref(u64),
    Other(String),
}

impl MetaValue {
    pub fn as_num(&self) -> Option<i64> {
        match self {
            MetaValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<u64> {
        match self {
            MetaValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetaNode {
    pub kind: String,
    pub fields: FxHashMap<String, MetaValue>,
}

impl MetaNode {
    pub fn field(&self, name: &str) -> Option<&MetaValue> {
        self.fields.get(name)
    }
}

#[derive(Default)]
pub struct DebugInfo {
    nodes: FxHashMap<u64, MetaNode>,
}

/// A resolved source location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

impl DebugInfo {
    pub fn insert(&mut self, id: u64, node: MetaNode) {
        self.nodes.insert(id, node);
    }

    pub fn node(&self, id: u64) -> Option<&MetaNode> {
        self.nodes.get(&id)
    }

    /// Follow `scope:` links until a node that names a file.
    fn file_of_scope(&self, mut scope: u64) -> Option<&MetaNode> {
        for _ in 0..8 {
            let node = self.nodes.get(&scope)?;
            if node.kind == "DIFile" {
                return Some(node);
            }
            if let Some(file) = node.field("file").and_then(MetaValue::as_ref_id) {
                return self.nodes.get(&file);
            }
            scope = node.field("scope").and_then(MetaValue::as_ref_id)?;
        }
        None
    }

    /// Resolve a `!dbg` reference to file/line/column.
    pub fn location(&self, dbg: u64) -> Option<Location> {
        let node = self.nodes.get(&dbg)?;
        if node.kind != "DILocation" {
            return None;
        }

        let line = node.field("line").and_then(MetaValue::as_num).unwrap_or(0) as u32;
        let column = node.field("column").and_then(MetaValue::as_num).unwrap_or(0) as u32;
        let filename = node
            .field("scope")
            .and_then(MetaValue::as_ref_id)
            .and_then(|scope| self.file_of_scope(scope))
            .and_then(|file| file.field("filename"))
            .and_then(MetaValue::as_str)
            .unwrap_or("")
            .to_owned();

        Some(Location {
            filename,
            line,
            column,
        })
    }

    /// The `directory/filename` pair of a function's `DISubprogram`.
    pub fn subprogram_path(&self, dbg: u64) -> Option<(String, String)> {
        let node = self.nodes.get(&dbg)?;
        if node.kind != "DISubprogram" {
            return None;
        }
        let file = node.field("file").and_then(MetaValue::as_ref_id)?;
        let file = self.nodes.get(&file)?;
        let filename = file.field("filename").and_then(MetaValue::as_str)?;
        let directory = file
            .field("directory")
            .and_then(MetaValue::as_str)
            .unwrap_or("");
        Some((directory.to_owned(), filename.to_owned()))
    }
}

/// Parse `!N = [distinct ]!DIKind(key: value, ...)`. Returns `None` for
/// metadata shapes we keep opaque (tuples, strings, expressions).
pub(crate) fn parse_metadata_line(line: &str) -> Option<(u64, MetaNode)> {
    let rest = line.strip_prefix('!')?;
    let (id, rest) = rest.split_once('=')?;
    let id: u64 = id.trim().parse().ok()?;

    let mut rest = rest.trim();
    if let Some(stripped) = rest.strip_prefix("distinct ") {
        rest = stripped.trim();
    }
    let rest = rest.strip_prefix('!')?;
    let paren = rest.find('(')?;
    let kind = rest[..paren].to_owned();
    if !kind.starts_with("DI") {
        return None;
    }
    let body = rest[paren + 1..].strip_suffix(')')?;

    let mut fields = FxHashMap::default();
    for part in split_top_level(body) {
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };
        let key = key.trim().to_owned();
        let value = value.trim();

        let parsed = if let Some(stripped) = value.strip_prefix('!') {
            stripped
                .parse::<u64>()
                .map(MetaValue::Ref)
                .unwrap_or_else(|_| MetaValue::Other(value.to_owned()))
        } else if let Some(stripped) = value.strip_prefix('"') {
            MetaValue::Str(
                stripped
                    .strip_suffix('"')
                    .unwrap_or(stripped)
                    .to_owned(),
            )
        } else if let Ok(num) = value.parse::<i64>() {
            MetaValue::Num(num)
        } else {
            MetaValue::Other(value.to_owned())
        };
        fields.insert(key, parsed);
    }

    Some((id, MetaNode { kind, fields }))
}

/// Split on commas outside parens/brackets/quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '(' | '[' | '{' | '<' if !in_string => depth += 1,
            ')' | ']' | '}' | '>' if !in_string => depth -= 1,
            ',' if !in_string && depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < body.len() {
        parts.push(&body[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_info_fixture() -> DebugInfo {
        let mut debug = DebugInfo::default();
        for line in [
            r#"!1 = !DIFile(filename: "demo.c", directory: "/tmp/src")"#,
            r#"!4 = distinct !DISubprogram(name: "foo", scope: !1, file: !1, line: 3, unit: !0)"#,
            r#"!7 = !DILexicalBlock(scope: !4, file: !1, line: 4, column: 5)"#,
            r#"!9 = !DILocation(line: 5, column: 11, scope: !7)"#,
            r#"!10 = !DILocation(line: 6, column: 3, scope: !4)"#,
        ] {
            if let Some((id, node)) = parse_metadata_line(line) {
                debug.insert(id, node);
            }
        }
        debug
    }

    #[test]
    fn location_resolves_through_lexical_blocks() {
        let debug = debug_info_fixture();
        let loc = debug.location(9).unwrap();
        assert_eq!(loc.filename, "demo.c");
        assert_eq!(loc.line, 5);
        assert_eq!(loc.column, 11);
    }

    #[test]
    fn location_resolves_direct_subprogram_scope() {
        let debug = debug_info_fixture();
        let loc = debug.location(10).unwrap();
        assert_eq!(loc.filename, "demo.c");
        assert_eq!(loc.line, 6);
    }

    #[test]
    fn subprogram_path_has_directory() {
        let debug = debug_info_fixture();
        let (dir, file) = debug.subprogram_path(4).unwrap();
        assert_eq!(dir, "/tmp/src");
        assert_eq!(file, "demo.c");
    }

    #[test]
    fn non_debug_metadata_is_ignored() {
        assert!(parse_metadata_line("!0 = !{i32 7, !\"Dwarf Version\", i32 5}").is_none());
        assert!(parse_metadata_line("!llvm.module.flags = !{!0}").is_none());
        assert!(parse_metadata_line("@g = global i32 0").is_none());
    }

    #[test]
    fn missing_nodes_resolve_to_none() {
        let debug = debug_info_fixture();
        assert!(debug.location(99).is_none());
        assert!(debug.subprogram_path(9).is_none());
    }
}
