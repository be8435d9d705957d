use serde_json::{Map, Value};

/// Fixed resolution policy for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    /// Newer side wins; a tie needs a user decision
    #[default]
    LastWriteWins,
    LocalWins,
    RemoteWins,
    /// Always park the conflict for a user decision
    Manual,
}

/// Combines two live versions of a record.
///
/// `base` is the last version both sides agreed on, if known. Returning
/// `None` means the edits overlap and the resolver falls back to
/// last-write-wins.
pub trait MergeFunction: Send + Sync {
    fn merge(&self, base: Option<&Value>, local: &Value, remote: &Value) -> Option<Value>;
}

impl<F> MergeFunction for F
where
    F: Fn(Option<&Value>, &Value, &Value) -> Option<Value> + Send + Sync,
{
    fn merge(&self, base: Option<&Value>, local: &Value, remote: &Value) -> Option<Value> {
        self(base, local, remote)
    }
}

/// Field-level three-way merge of JSON objects.
///
/// A field changed on one side only takes that side's value. A field changed
/// on both sides merges only if both sides agree on the new value. Without a
/// base every field counts as changed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl MergeFunction for FieldMerge {
    fn merge(&self, base: Option<&Value>, local: &Value, remote: &Value) -> Option<Value> {
        let empty = Map::new();
        let local = local.as_object()?;
        let remote = remote.as_object()?;
        let base = match base {
            Some(value) => value.as_object()?,
            None => &empty,
        };

        let mut merged = Map::new();
        let keys = base.keys().chain(local.keys()).chain(remote.keys());
        for key in keys {
            if merged.contains_key(key) {
                continue;
            }
            let b = base.get(key);
            let l = local.get(key);
            let r = remote.get(key);

            let local_changed = l != b;
            let remote_changed = r != b;
            let value = match (local_changed, remote_changed) {
                (true, true) if l != r => return None,
                (true, _) => l,
                (false, true) => r,
                (false, false) => b,
            };
            // Absent on the winning side means the field was removed
            if let Some(value) = value {
                merged.insert(key.clone(), value.clone());
            }
        }
        Some(Value::Object(merged))
    }
}
