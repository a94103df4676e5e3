//! Execution-local hierarchical data model.
//!
//! A mutable JSON tree rooted at `/workflow`. Operations read upstream
//! results out of it and write their own results into it; the executor owns
//! the instance and it dies with the execution. Reads hand back deep copies
//! so an operation can never mutate upstream data in place.

use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::path::{DataPath, PathSegment};

/// The tree plus its configured byte budget.
#[derive(Debug)]
pub struct DataModel {
    root: Map<String, Value>,
    max_bytes: usize,
}

impl DataModel {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            root: Map::new(),
            max_bytes,
        }
    }

    /// Read the subtree at `path` as a deep copy.
    pub fn read(&self, path: &DataPath) -> Result<Value, EngineError> {
        let not_found = |message: &str| EngineError::Data {
            path: path.to_string(),
            message: message.to_string(),
        };

        if path.is_root() {
            return Ok(Value::Object(self.root.clone()));
        }

        // First segment resolves against the root map directly.
        let mut segments = path.segments().iter();
        let mut current: &Value = match segments.next() {
            Some(PathSegment::Key(key)) => {
                self.root.get(key).ok_or_else(|| not_found("path not found"))?
            }
            Some(PathSegment::Index(_)) => {
                return Err(not_found("the workflow root is not an array"));
            }
            None => unreachable!("non-root path has at least one segment"),
        };

        for segment in segments {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => {
                    map.get(key).ok_or_else(|| not_found("path not found"))?
                }
                (PathSegment::Index(index), Value::Array(items)) => items
                    .get(*index)
                    .ok_or_else(|| not_found("array index out of bounds"))?,
                (PathSegment::Key(_), _) => {
                    return Err(not_found("expected an object along the path"))
                }
                (PathSegment::Index(_), _) => {
                    return Err(not_found("expected an array along the path"))
                }
            };
        }

        Ok(current.clone())
    }

    pub fn exists(&self, path: &DataPath) -> bool {
        self.read(path).is_ok()
    }

    /// Write `value` at the leaf `path`, replacing anything already there.
    /// Missing intermediate key segments are autovivified as objects; index
    /// segments must land inside an existing array (a final index equal to
    /// the length appends).
    pub fn write(&mut self, path: &DataPath, value: Value) -> Result<(), EngineError> {
        let bad_write = |message: &str| EngineError::Data {
            path: path.to_string(),
            message: message.to_string(),
        };

        let segments = path.segments();
        if segments.is_empty() {
            return Err(bad_write("writes must target a path below /workflow"));
        }

        let first = match &segments[0] {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(_) => {
                return Err(bad_write("the workflow root is not an array"))
            }
        };

        if segments.len() == 1 {
            self.root.insert(first, value);
        } else {
            let slot = self
                .root
                .entry(first)
                .or_insert_with(|| Value::Object(Map::new()));
            write_into(slot, &segments[1..], value, &bad_write)?;
        }

        self.check_budget(path)
    }

    /// Drop the subtree at a first-level key, if present. Used to clear loop
    /// scratch bindings.
    pub fn remove_head(&mut self, key: &str) {
        self.root.remove(key);
    }

    /// The first-level entries of the tree.
    pub fn entries(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Serialized size of the whole tree.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.root).map(|v| v.len()).unwrap_or(0)
    }

    fn check_budget(&self, path: &DataPath) -> Result<(), EngineError> {
        let size = self.size_bytes();
        if size > self.max_bytes {
            return Err(EngineError::Resource(format!(
                "data model grew to {size} bytes (cap {}) writing {path}",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

fn write_into(
    current: &mut Value,
    segments: &[PathSegment],
    value: Value,
    bad_write: &impl Fn(&str) -> EngineError,
) -> Result<(), EngineError> {
    let (segment, rest) = segments.split_first().expect("non-empty remainder");
    let at_leaf = rest.is_empty();

    match segment {
        PathSegment::Key(key) => {
            let map = match current {
                Value::Object(map) => map,
                _ => return Err(bad_write("expected an object along the path")),
            };
            if at_leaf {
                map.insert(key.clone(), value);
                Ok(())
            } else {
                let slot = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                write_into(slot, rest, value, bad_write)
            }
        }
        PathSegment::Index(index) => {
            let items = match current {
                Value::Array(items) => items,
                _ => return Err(bad_write("expected an array along the path")),
            };
            if at_leaf {
                if *index < items.len() {
                    items[*index] = value;
                    Ok(())
                } else if *index == items.len() {
                    items.push(value);
                    Ok(())
                } else {
                    Err(bad_write("array index out of bounds"))
                }
            } else {
                let slot = items
                    .get_mut(*index)
                    .ok_or_else(|| bad_write("array index out of bounds"))?;
                write_into(slot, rest, value, bad_write)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> DataPath {
        DataPath::parse(s).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/users"), json!([{"id": 1}])).unwrap();
        assert_eq!(model.read(&path("/workflow/users")).unwrap(), json!([{"id": 1}]));
        assert_eq!(model.read(&path("/workflow/users[0].id")).unwrap(), json!(1));
    }

    #[test]
    fn test_autovivifies_intermediate_objects() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/a/b/c"), json!(42)).unwrap();
        assert_eq!(model.read(&path("/workflow/a")).unwrap(), json!({"b": {"c": 42}}));
    }

    #[test]
    fn test_read_missing_path_is_data_error() {
        let model = DataModel::new(1 << 20);
        let err = model.read(&path("/workflow/nothing")).unwrap_err();
        assert!(matches!(err, EngineError::Data { .. }));
    }

    #[test]
    fn test_index_out_of_bounds_is_data_error_not_panic() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/items"), json!([1, 2])).unwrap();
        let err = model.read(&path("/workflow/items[5]")).unwrap_err();
        assert!(matches!(err, EngineError::Data { .. }));
    }

    #[test]
    fn test_reads_are_deep_copies() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/src"), json!({"n": 1})).unwrap();
        let mut copy = model.read(&path("/workflow/src")).unwrap();
        copy["n"] = json!(2);
        assert_eq!(model.read(&path("/workflow/src/n")).unwrap(), json!(1));
    }

    #[test]
    fn test_write_replaces_leaf() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/x"), json!(1)).unwrap();
        model.write(&path("/workflow/x"), json!([2, 3])).unwrap();
        assert_eq!(model.read(&path("/workflow/x")).unwrap(), json!([2, 3]));
    }

    #[test]
    fn test_index_append_and_replace() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/out"), json!([])).unwrap();
        model.write(&path("/workflow/out[0]"), json!("a")).unwrap();
        model.write(&path("/workflow/out[1]"), json!("b")).unwrap();
        model.write(&path("/workflow/out[0]"), json!("c")).unwrap();
        assert_eq!(model.read(&path("/workflow/out")).unwrap(), json!(["c", "b"]));
        assert!(model.write(&path("/workflow/out[9]"), json!("x")).is_err());
    }

    #[test]
    fn test_byte_budget_enforced() {
        let mut model = DataModel::new(64);
        let err = model
            .write(&path("/workflow/big"), json!("x".repeat(200)))
            .unwrap_err();
        assert!(matches!(err, EngineError::Resource(_)));
    }

    #[test]
    fn test_remove_head() {
        let mut model = DataModel::new(1 << 20);
        model.write(&path("/workflow/_loop/current"), json!(1)).unwrap();
        model.remove_head("_loop");
        assert!(!model.exists(&path("/workflow/_loop")));
    }
}
