//! Slash-path grammar and reference resolution.
//!
//! Paths address the execution-local data model:
//!
//! ```text
//! /workflow ( "/" segment | "[" index "]" | "." field )*
//! ```
//!
//! Segments and fields are non-empty `[A-Za-z0-9_-]+` identifiers; `.field`
//! is alternate syntax for a key segment, so `/workflow/a.b` and
//! `/workflow/a/b` address the same node. The canonical rendering uses `/`
//! for keys and `[n]` for indices.
//!
//! References appear in operation arguments two ways: a string literal that
//! is a valid path, or a `{/workflow/...}` template inside a larger string.
//! Declared path slots (`inputPath`, `sources`, `condition.path`) are read
//! through the data model by the operation itself and are left untouched by
//! [`resolve_references`]; `outputPath` is a write slot and is neither read
//! nor substituted.

use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;

use crate::error::EngineError;

/// One step into the data model tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed path rooted at `/workflow`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataPath {
    segments: Vec<PathSegment>,
}

const ROOT: &str = "/workflow";

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(/workflow[^{}]*)\}").expect("template pattern"))
}

impl DataPath {
    /// Parse a path expression. Anything not rooted at `/workflow` is
    /// rejected.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let malformed = |message: &str| EngineError::Data {
            path: input.to_string(),
            message: message.to_string(),
        };

        let rest = input
            .strip_prefix(ROOT)
            .ok_or_else(|| malformed("path must start with /workflow"))?;

        let bytes = rest.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            match bytes[pos] {
                b'/' | b'.' => {
                    pos += 1;
                    let start = pos;
                    while pos < bytes.len() && is_ident_byte(bytes[pos]) {
                        pos += 1;
                    }
                    if pos == start {
                        return Err(malformed("empty path segment"));
                    }
                    segments.push(PathSegment::Key(rest[start..pos].to_string()));
                }
                b'[' => {
                    pos += 1;
                    let start = pos;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    if pos == start || pos >= bytes.len() || bytes[pos] != b']' {
                        return Err(malformed("malformed array index"));
                    }
                    let index: usize = rest[start..pos]
                        .parse()
                        .map_err(|_| malformed("array index out of range"))?;
                    segments.push(PathSegment::Index(index));
                    pos += 1;
                }
                _ => return Err(malformed("unexpected character in path")),
            }
        }

        Ok(Self { segments })
    }

    /// The segments below the `/workflow` root.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The bare `/workflow` root.
    pub fn root() -> Self {
        Self { segments: vec![] }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// First key segment, when present. `/workflow/_loop/...` detection and
    /// response grouping both key off this.
    pub fn head(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// Whether `self` addresses `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &DataPath) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Child key path.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Key(key.into()));
        Self { segments }
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ROOT}")?;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(k) => write!(f, "/{k}")?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// REFERENCE WALKING
// ============================================================================

/// Keys whose string values are consumed as paths by the operation itself.
const READ_SLOT_KEYS: &[&str] = &["inputPath", "path"];
const READ_SLOT_LIST_KEYS: &[&str] = &["sources"];
const WRITE_SLOT_KEY: &str = "outputPath";

/// Whether a JSON object is a credential reference marker.
pub fn is_credential_ref(value: &Value) -> bool {
    matches!(value.as_object(), Some(map) if map.len() == 1 && map.contains_key("credentialRef"))
}

/// Parse a string as a bare path reference. Strings that merely start with
/// `/workflow` but do not parse are plain literals, not references.
fn as_bare_reference(s: &str) -> Option<DataPath> {
    if s == ROOT || s.starts_with("/workflow/") || s.starts_with("/workflow[") {
        DataPath::parse(s).ok()
    } else {
        None
    }
}

/// Collect every path this argument tree reads: declared read slots plus
/// bare-string and `{...}` template references in value position.
pub fn collect_references(args: &Value) -> Result<Vec<DataPath>, EngineError> {
    let mut refs = Vec::new();
    walk_collect(args, &mut refs)?;
    Ok(refs)
}

fn walk_collect(value: &Value, refs: &mut Vec<DataPath>) -> Result<(), EngineError> {
    match value {
        Value::Object(map) => {
            if is_credential_ref(value) {
                return Ok(());
            }
            for (key, child) in map {
                if key == WRITE_SLOT_KEY {
                    continue;
                }
                if READ_SLOT_KEYS.contains(&key.as_str()) {
                    if let Some(s) = child.as_str() {
                        refs.push(DataPath::parse(s)?);
                        continue;
                    }
                }
                if READ_SLOT_LIST_KEYS.contains(&key.as_str()) {
                    if let Some(items) = child.as_array() {
                        for item in items {
                            if let Some(s) = item.as_str() {
                                refs.push(DataPath::parse(s)?);
                            }
                        }
                        continue;
                    }
                }
                walk_collect(child, refs)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_collect(item, refs)?;
            }
        }
        Value::String(s) => {
            if let Some(path) = as_bare_reference(s) {
                refs.push(path);
            } else {
                for captures in template_pattern().captures_iter(s) {
                    refs.push(DataPath::parse(&captures[1])?);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute value-position references, leaving declared path slots and
/// credential markers untouched. `read` supplies the referenced value; it is
/// invoked once per reference occurrence.
pub fn resolve_references<F>(args: &Value, read: &F) -> Result<Value, EngineError>
where
    F: Fn(&DataPath) -> Result<Value, EngineError>,
{
    match args {
        Value::Object(map) => {
            if is_credential_ref(args) {
                return Ok(args.clone());
            }
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let keep_verbatim = key == WRITE_SLOT_KEY
                    || (READ_SLOT_KEYS.contains(&key.as_str()) && child.is_string())
                    || (READ_SLOT_LIST_KEYS.contains(&key.as_str()) && child.is_array());
                let resolved = if keep_verbatim {
                    child.clone()
                } else {
                    resolve_references(child, read)?
                };
                out.insert(key.clone(), resolved);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_references(item, read))
                .collect::<Result<_, _>>()?,
        )),
        Value::String(s) => {
            if let Some(path) = as_bare_reference(s) {
                return read(&path);
            }
            if !template_pattern().is_match(s) {
                return Ok(args.clone());
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for captures in template_pattern().captures_iter(s) {
                let whole = captures.get(0).expect("capture 0");
                out.push_str(&s[last..whole.start()]);
                let value = read(&DataPath::parse(&captures[1])?)?;
                out.push_str(&stringify(&value));
                last = whole.end();
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        _ => Ok(args.clone()),
    }
}

/// String form used when a reference is spliced into a template.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = DataPath::parse("/workflow/users[2].name").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("users".into()),
                PathSegment::Index(2),
                PathSegment::Key("name".into()),
            ]
        );
        assert_eq!(path.to_string(), "/workflow/users[2]/name");
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(DataPath::parse("/other/users").is_err());
        assert!(DataPath::parse("/workflow//x").is_err());
        assert!(DataPath::parse("/workflow/a[").is_err());
        assert!(DataPath::parse("/workflow/a[x]").is_err());
        assert!(DataPath::parse("/workflow/a b").is_err());
        assert!(DataPath::parse("workflow/a").is_err());
    }

    #[test]
    fn test_root_and_prefix() {
        let root = DataPath::parse("/workflow").unwrap();
        assert!(root.is_root());
        let users = DataPath::parse("/workflow/users").unwrap();
        let first = DataPath::parse("/workflow/users[0]").unwrap();
        assert!(users.is_prefix_of(&first));
        assert!(root.is_prefix_of(&users));
        assert!(!first.is_prefix_of(&users));
    }

    #[test]
    fn test_collect_references() {
        let args = json!({
            "inputPath": "/workflow/users",
            "outputPath": "/workflow/top",
            "conditions": [{"field": "points", "operator": ">", "value": "/workflow/threshold"}],
            "url": "https://api.example.com/users/{/workflow/selected[0].id}/posts",
        });
        let refs = collect_references(&args).unwrap();
        let rendered: Vec<String> = refs.iter().map(|p| p.to_string()).collect();
        assert!(rendered.contains(&"/workflow/users".to_string()));
        assert!(rendered.contains(&"/workflow/threshold".to_string()));
        assert!(rendered.contains(&"/workflow/selected[0]/id".to_string()));
        // outputPath is a write slot, never a read
        assert!(!rendered.contains(&"/workflow/top".to_string()));
    }

    #[test]
    fn test_resolve_substitutes_values_not_slots() {
        let args = json!({
            "inputPath": "/workflow/users",
            "outputPath": "/workflow/top",
            "body": {"threshold": "/workflow/threshold"},
            "url": "https://api.example.com/u/{/workflow/id}",
        });
        let resolved = resolve_references(&args, &|path| {
            Ok(match path.to_string().as_str() {
                "/workflow/threshold" => json!(100),
                "/workflow/id" => json!("abc"),
                other => panic!("unexpected read of {other}"),
            })
        })
        .unwrap();
        assert_eq!(resolved["inputPath"], "/workflow/users");
        assert_eq!(resolved["outputPath"], "/workflow/top");
        assert_eq!(resolved["body"]["threshold"], 100);
        assert_eq!(resolved["url"], "https://api.example.com/u/abc");
    }

    #[test]
    fn test_resolve_leaves_credential_refs() {
        let args = json!({"headers": {"Authorization": {"credentialRef": {"id": "github"}}}});
        let resolved =
            resolve_references(&args, &|_| panic!("credential markers are not reads")).unwrap();
        assert_eq!(resolved, args);
    }

    #[test]
    fn test_non_reference_strings_pass_through() {
        let args = json!({"note": "/workflow is the root, braces {stay}"});
        let resolved = resolve_references(&args, &|_| panic!("no reads expected")).unwrap();
        assert_eq!(resolved, args);
    }
}
