// JSON state tree with undo records.
//
// `StateTree` is the document every peer replicates. Applying a `Mutation`
// resolves its path against the *current* tree and returns an `Undo` that
// restores the exact pre-image: the replaced value, the removed element, or
// the absence of a slot that the mutation created. Followers keep these
// records for their speculative tail so a divergent suffix can be rewound
// (see `replica.rs`).
//
// Path resolution rules:
// - `Set` creates missing intermediate objects along `Key` segments. Writing
//   to an array index equal to the array's length appends.
// - `Delete` removes an object key (absent key is a no-op) or splices an
//   array element, shifting later elements down.
// - `Append` pushes onto the array at its path; if the path is absent it
//   behaves like `Set` with a one-element array.
// Anything else (indexing an object, keying an array, walking through a
// scalar, an out-of-range index) is `StoreError::InvalidPath`, and leaves
// the tree untouched.

use lockstep_protocol::transaction::display_path;
use lockstep_protocol::{Mutation, PathSegment};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Reverses one applied mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Undo {
    /// The slot existed; put its previous value back.
    Restore { path: Vec<PathSegment>, previous: Value },
    /// The slot was created; take it out again (splicing arrays).
    Remove { path: Vec<PathSegment> },
    /// The slot was deleted; insert it back (splicing arrays).
    Reinsert { path: Vec<PathSegment>, value: Value },
    /// The mutation changed nothing.
    Noop,
}

/// A replicated JSON document.
#[derive(Clone, Debug, PartialEq)]
pub struct StateTree {
    root: Value,
}

impl Default for StateTree {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

impl StateTree {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &[PathSegment]) -> Option<&Value> {
        let mut cur = &self.root;
        for seg in path {
            cur = match seg {
                PathSegment::Key(k) => cur.as_object()?.get(k)?,
                PathSegment::Index(i) => cur.as_array()?.get(usize::try_from(*i).ok()?)?,
            };
        }
        Some(cur)
    }

    /// Apply one mutation, returning the record that reverses it.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Undo> {
        match mutation {
            Mutation::Set { path, value } => self.set(path, value.clone()),
            Mutation::Delete { path } => self.delete(path),
            Mutation::Append { path, value } => {
                let len = match self.get(path) {
                    Some(Value::Array(arr)) => Some(arr.len()),
                    Some(_) => return Err(invalid(path, "append target is not an array")),
                    None => None,
                };
                match len {
                    Some(len) => {
                        let mut slot = path.clone();
                        slot.push(PathSegment::Index(len as u64));
                        self.set(&slot, value.clone())
                    }
                    None => self.set(path, Value::Array(vec![value.clone()])),
                }
            }
        }
    }

    /// Apply a whole transaction atomically. On failure every mutation
    /// already applied is unwound and the error is returned.
    pub fn apply_all(&mut self, mutations: &[Mutation]) -> Result<Vec<Undo>> {
        let mut undos = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            match self.apply(mutation) {
                Ok(undo) => undos.push(undo),
                Err(e) => {
                    self.undo_all(undos)?;
                    return Err(e);
                }
            }
        }
        Ok(undos)
    }

    /// Reverse a batch of undo records produced by `apply_all`, newest first.
    pub fn undo_all(&mut self, undos: Vec<Undo>) -> Result<()> {
        for undo in undos.into_iter().rev() {
            self.undo(undo)?;
        }
        Ok(())
    }

    pub fn undo(&mut self, undo: Undo) -> Result<()> {
        match undo {
            Undo::Noop => Ok(()),
            Undo::Restore { path, previous } => {
                if path.is_empty() {
                    self.root = previous;
                    return Ok(());
                }
                if let (Some(parent), Some(seg)) = self.parent_mut(&path)? {
                    *slot_mut(parent, seg, &path)? = previous;
                }
                Ok(())
            }
            Undo::Remove { path } => {
                let (Some(parent), Some(seg)) = self.parent_mut(&path)? else {
                    return Err(invalid(&path, "cannot remove the root"));
                };
                remove_slot(parent, seg, &path).map(|_| ())
            }
            Undo::Reinsert { path, value } => {
                let (Some(parent), Some(seg)) = self.parent_mut(&path)? else {
                    return Err(invalid(&path, "cannot reinsert the root"));
                };
                match (parent, seg) {
                    (Value::Object(obj), PathSegment::Key(k)) => {
                        obj.insert(k.clone(), value);
                        Ok(())
                    }
                    (Value::Array(arr), PathSegment::Index(i)) => {
                        let i = index_within(*i, arr.len() + 1, &path)?;
                        arr.insert(i, value);
                        Ok(())
                    }
                    _ => Err(invalid(&path, "container type changed")),
                }
            }
        }
    }

    fn set(&mut self, path: &[PathSegment], value: Value) -> Result<Undo> {
        let Some((last, parents)) = path.split_last() else {
            let previous = std::mem::replace(&mut self.root, value);
            return Ok(Undo::Restore {
                path: Vec::new(),
                previous,
            });
        };

        // Validate before touching anything so a failure leaves no trace.
        let created_from = self.plan_set(parents, last, path)?;

        let mut cur = &mut self.root;
        for seg in parents {
            cur = match seg {
                PathSegment::Key(k) => match cur {
                    Value::Object(obj) => obj
                        .entry(k.clone())
                        .or_insert_with(|| Value::Object(Map::new())),
                    _ => return Err(invalid(path, "expected an object")),
                },
                PathSegment::Index(i) => slot_mut(cur, seg, path)
                    .map_err(|_| invalid(path, &format!("index {i} out of range")))?,
            };
        }

        let undo_created = |depth: usize| Undo::Remove {
            path: path[..=depth].to_vec(),
        };
        match (cur, last) {
            (Value::Object(obj), PathSegment::Key(k)) => match obj.insert(k.clone(), value) {
                Some(previous) => Ok(Undo::Restore {
                    path: path.to_vec(),
                    previous,
                }),
                None => Ok(undo_created(created_from.unwrap_or(parents.len()))),
            },
            (Value::Array(arr), PathSegment::Index(i)) => {
                let i = index_within(*i, arr.len() + 1, path)?;
                if i == arr.len() {
                    arr.push(value);
                    Ok(undo_created(parents.len()))
                } else {
                    let previous = std::mem::replace(&mut arr[i], value);
                    Ok(Undo::Restore {
                        path: path.to_vec(),
                        previous,
                    })
                }
            }
            _ => Err(invalid(path, "segment does not match container type")),
        }
    }

    /// Check that `set` can succeed. Returns the depth of the first
    /// intermediate object that would have to be created, if any.
    fn plan_set(
        &self,
        parents: &[PathSegment],
        last: &PathSegment,
        path: &[PathSegment],
    ) -> Result<Option<usize>> {
        let mut cur = &self.root;
        for (depth, seg) in parents.iter().enumerate() {
            match (cur, seg) {
                (Value::Object(obj), PathSegment::Key(k)) => match obj.get(k) {
                    Some(next) => cur = next,
                    None => {
                        // Everything below here is freshly created objects,
                        // so only keys can follow.
                        let all_keys = parents[depth + 1..]
                            .iter()
                            .chain(std::iter::once(last))
                            .all(|s| matches!(s, PathSegment::Key(_)));
                        if !all_keys {
                            return Err(invalid(path, "cannot index into a missing array"));
                        }
                        return Ok(Some(depth));
                    }
                },
                (Value::Array(arr), PathSegment::Index(i)) => {
                    let i = index_within(*i, arr.len(), path)?;
                    cur = &arr[i];
                }
                _ => return Err(invalid(path, "segment does not match container type")),
            }
        }
        match (cur, last) {
            (Value::Object(_), PathSegment::Key(_)) => Ok(None),
            (Value::Array(arr), PathSegment::Index(i)) => {
                index_within(*i, arr.len() + 1, path)?;
                Ok(None)
            }
            _ => Err(invalid(path, "segment does not match container type")),
        }
    }

    fn delete(&mut self, path: &[PathSegment]) -> Result<Undo> {
        let (Some(parent), Some(seg)) = self.parent_mut(path)? else {
            return Err(invalid(path, "cannot delete the root"));
        };
        match (parent, seg) {
            (Value::Object(obj), PathSegment::Key(k)) => Ok(match obj.remove(k) {
                Some(value) => Undo::Reinsert {
                    path: path.to_vec(),
                    value,
                },
                None => Undo::Noop,
            }),
            (Value::Array(arr), PathSegment::Index(i)) => {
                let i = index_within(*i, arr.len(), path)?;
                Ok(Undo::Reinsert {
                    path: path.to_vec(),
                    value: arr.remove(i),
                })
            }
            _ => Err(invalid(path, "segment does not match container type")),
        }
    }

    /// Walk to the container holding the last segment of `path`. Returns
    /// `(None, None)` for the root path.
    fn parent_mut<'a>(
        &mut self,
        path: &'a [PathSegment],
    ) -> Result<(Option<&mut Value>, Option<&'a PathSegment>)> {
        let Some((last, parents)) = path.split_last() else {
            return Ok((None, None));
        };
        let mut cur = &mut self.root;
        for seg in parents {
            cur = slot_mut(cur, seg, path)?;
        }
        Ok((Some(cur), Some(last)))
    }
}

fn slot_mut<'v>(
    container: &'v mut Value,
    seg: &PathSegment,
    path: &[PathSegment],
) -> Result<&'v mut Value> {
    match (container, seg) {
        (Value::Object(obj), PathSegment::Key(k)) => obj
            .get_mut(k)
            .ok_or_else(|| invalid(path, &format!("missing key {k:?}"))),
        (Value::Array(arr), PathSegment::Index(i)) => {
            let i = index_within(*i, arr.len(), path)?;
            Ok(&mut arr[i])
        }
        _ => Err(invalid(path, "segment does not match container type")),
    }
}

fn remove_slot(container: &mut Value, seg: &PathSegment, path: &[PathSegment]) -> Result<Value> {
    match (container, seg) {
        (Value::Object(obj), PathSegment::Key(k)) => obj
            .remove(k)
            .ok_or_else(|| invalid(path, &format!("missing key {k:?}"))),
        (Value::Array(arr), PathSegment::Index(i)) => {
            let i = index_within(*i, arr.len(), path)?;
            Ok(arr.remove(i))
        }
        _ => Err(invalid(path, "segment does not match container type")),
    }
}

/// `i` as a usize, provided it is below `bound`.
fn index_within(i: u64, bound: usize, path: &[PathSegment]) -> Result<usize> {
    match usize::try_from(i) {
        Ok(i) if i < bound => Ok(i),
        _ => Err(invalid(path, &format!("index {i} out of range"))),
    }
}

fn invalid(path: &[PathSegment], reason: &str) -> StoreError {
    StoreError::InvalidPath {
        path: display_path(path),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::path;
    use serde_json::json;

    use super::*;

    fn tree(v: Value) -> StateTree {
        StateTree::new(v)
    }

    #[test]
    fn set_then_undo_restores_previous() {
        let mut t = tree(json!({"ayy": "lmao"}));
        let undo = t.apply(&Mutation::set(path!["ayy"], "ayy")).unwrap();
        assert_eq!(t.root(), &json!({"ayy": "ayy"}));
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({"ayy": "lmao"}));
    }

    #[test]
    fn set_creates_intermediates_and_undo_removes_them() {
        let mut t = StateTree::default();
        let undo = t.apply(&Mutation::set(path!["a", "b", "c"], 1)).unwrap();
        assert_eq!(t.root(), &json!({"a": {"b": {"c": 1}}}));
        assert_eq!(undo, Undo::Remove { path: path!["a"] });
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({}));
    }

    #[test]
    fn set_through_missing_array_is_rejected_without_side_effects() {
        let mut t = StateTree::default();
        let err = t.apply(&Mutation::set(path!["a", 0u64], 1)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath { .. }));
        assert_eq!(t.root(), &json!({}));
    }

    #[test]
    fn set_at_array_length_appends() {
        let mut t = tree(json!({"xs": [1]}));
        let undo = t.apply(&Mutation::set(path!["xs", 1u64], 2)).unwrap();
        assert_eq!(t.root(), &json!({"xs": [1, 2]}));
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({"xs": [1]}));
        assert!(t.apply(&Mutation::set(path!["xs", 5u64], 2)).is_err());
    }

    #[test]
    fn append_resolves_against_live_length() {
        let mut t = tree(json!({"moves": ["e4"]}));
        t.apply(&Mutation::append(path!["moves"], "e5")).unwrap();
        let undo = t.apply(&Mutation::append(path!["moves"], "Nf3")).unwrap();
        assert_eq!(t.root(), &json!({"moves": ["e4", "e5", "Nf3"]}));
        assert_eq!(
            undo,
            Undo::Remove {
                path: path!["moves", 2u64]
            }
        );
    }

    #[test]
    fn append_to_missing_path_creates_array() {
        let mut t = StateTree::default();
        t.apply(&Mutation::append(path!["log"], "hi")).unwrap();
        assert_eq!(t.root(), &json!({"log": ["hi"]}));
        assert!(t.apply(&Mutation::append(path!["log", 0u64], 1)).is_err());
    }

    #[test]
    fn delete_array_element_shifts_and_undo_reinserts() {
        let mut t = tree(json!({"xs": ["a", "b", "c"]}));
        let undo = t.apply(&Mutation::delete(path!["xs", 1u64])).unwrap();
        assert_eq!(t.root(), &json!({"xs": ["a", "c"]}));
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({"xs": ["a", "b", "c"]}));
    }

    #[test]
    fn delete_object_key() {
        let mut t = tree(json!({"k": 1, "j": 2}));
        let undo = t.apply(&Mutation::delete(path!["k"])).unwrap();
        assert_eq!(t.root(), &json!({"j": 2}));
        assert_eq!(t.apply(&Mutation::delete(path!["k"])).unwrap(), Undo::Noop);
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({"k": 1, "j": 2}));
    }

    #[test]
    fn delete_out_of_range_is_invalid() {
        let mut t = tree(json!({"xs": []}));
        assert!(t.apply(&Mutation::delete(path!["xs", 0u64])).is_err());
        assert!(t.apply(&Mutation::delete(path![])).is_err());
    }

    #[test]
    fn apply_all_is_atomic() {
        let mut t = tree(json!({"a": 1, "xs": []}));
        let err = t.apply_all(&[
            Mutation::set(path!["a"], 2),
            Mutation::append(path!["xs"], 3),
            Mutation::set(path!["a", "nested"], 4),
        ]);
        assert!(err.is_err());
        assert_eq!(t.root(), &json!({"a": 1, "xs": []}));
    }

    #[test]
    fn undo_all_reverses_in_order() {
        let mut t = tree(json!({"xs": ["a"]}));
        let undos = t
            .apply_all(&[
                Mutation::append(path!["xs"], "b"),
                Mutation::delete(path!["xs", 0u64]),
                Mutation::set(path!["xs", 0u64], "B"),
            ])
            .unwrap();
        assert_eq!(t.root(), &json!({"xs": ["B"]}));
        t.undo_all(undos).unwrap();
        assert_eq!(t.root(), &json!({"xs": ["a"]}));
    }

    #[test]
    fn root_set_is_reversible() {
        let mut t = tree(json!({"old": true}));
        let undo = t.apply(&Mutation::set(path![], json!({"new": true}))).unwrap();
        assert_eq!(t.root(), &json!({"new": true}));
        t.undo(undo).unwrap();
        assert_eq!(t.root(), &json!({"old": true}));
    }

    #[test]
    fn get_follows_mixed_paths() {
        let t = tree(json!({"board": [{"piece": "rook"}]}));
        assert_eq!(t.get(&path!["board", 0u64, "piece"]), Some(&json!("rook")));
        assert_eq!(t.get(&path!["board", 1u64]), None);
        assert_eq!(t.get(&path!["board", "x"]), None);
    }
}
