//! Field-level merge engine for upsert resolution
//!
//! Two mutually exclusive modes operate on dynamic record trees:
//!
//! - **Preservation-rule mode** (default): the incoming record overwrites the
//!   existing snapshot via a recursive object merge, after which configured
//!   preservation rules are re-applied on top: collection fields become the
//!   union of existing and incoming values, preserved scalars keep the
//!   existing value verbatim.
//! - **Patch-path mode**: the outgoing record is the existing snapshot with
//!   only the listed field paths overwritten from the incoming record.
//!
//! Field paths are dot-delimited and parsed once at job start; they address
//! nested objects only. A path may select a whole array field but never an
//! index into one.

use serde_json::Value;

use crate::error::{Result, SyncError};

/// A dot-delimited field path, pre-parsed into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-delimited path such as `personal.addresses`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(SyncError::config("field path must not be empty"));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(SyncError::config(format!(
                "field path '{raw}' contains an empty segment"
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How the status-like field is treated during an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusRule {
    /// Keep the existing value (the default)
    #[default]
    Preserve,
    /// Let the incoming value win
    Overwrite,
}

/// Compiled merge rule set; deterministic input to every merge.
#[derive(Debug, Clone)]
pub struct MergeRules {
    /// Collection fields merged as existing ∪ incoming
    pub preserve_collections: Vec<FieldPath>,
    /// Scalar fields kept verbatim from the existing snapshot
    pub preserve_scalars: Vec<FieldPath>,
    /// Treatment of the status field
    pub status: StatusRule,
    /// Path of the status-like field
    pub status_path: FieldPath,
    /// When set, patch-path mode is active and rules above are ignored
    pub patch_paths: Option<Vec<FieldPath>>,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            preserve_collections: Vec::new(),
            preserve_scalars: Vec::new(),
            status: StatusRule::Preserve,
            status_path: FieldPath {
                raw: "status".to_string(),
                segments: vec!["status".to_string()],
            },
            patch_paths: None,
        }
    }
}

/// Read the value at `path`, descending through nested objects.
pub fn get_path<'a>(value: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `new_value` at `path`, creating intermediate objects as needed.
///
/// Intermediate non-object values are replaced; paths never index arrays.
pub fn set_path(value: &mut Value, path: &FieldPath, new_value: Value) {
    let mut current = value;
    let (last, intermediate) = match path.segments().split_last() {
        Some(split) => split,
        None => return,
    };
    for segment in intermediate {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let object = match current.as_object_mut() {
            Some(object) => object,
            None => return,
        };
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(last.clone(), new_value);
    }
}

/// Remove the value at `path`, if present.
pub fn remove_path(value: &mut Value, path: &FieldPath) {
    let mut current = value;
    let (last, intermediate) = match path.segments().split_last() {
        Some(split) => split,
        None => return,
    };
    for segment in intermediate {
        current = match current.as_object_mut().and_then(|o| o.get_mut(segment)) {
            Some(next) => next,
            None => return,
        };
    }
    if let Some(object) = current.as_object_mut() {
        object.remove(last);
    }
}

/// Recursive object merge: `source` fields overwrite `target` fields,
/// nested objects merge key by key, arrays and scalars are replaced
/// wholesale.
pub fn deep_update(target: &mut Value, source: &Value) {
    match (target.as_object_mut(), source.as_object()) {
        (Some(target_map), Some(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(key) {
                    Some(target_value) if target_value.is_object() && source_value.is_object() => {
                        deep_update(target_value, source_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        _ => *target = source.clone(),
    }
}

/// Union of two collection values: existing entries first, then incoming
/// entries not already present. Exact duplicates are dropped; non-array
/// operands fall back to the incoming value.
fn union_collection(existing: &Value, incoming: &Value) -> Value {
    match (existing.as_array(), incoming.as_array()) {
        (Some(existing_items), Some(incoming_items)) => {
            let mut merged = existing_items.clone();
            for item in incoming_items {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        _ => incoming.clone(),
    }
}

/// Compute the outgoing record for an update.
///
/// Identifier and version handling belong to the resolver; this function is
/// a pure merge over (existing snapshot, incoming record, rules).
pub fn merge_for_update(existing: &Value, incoming: &Value, rules: &MergeRules) -> Value {
    if let Some(paths) = &rules.patch_paths {
        return patch_record(existing, incoming, paths);
    }

    let mut outgoing = existing.clone();
    deep_update(&mut outgoing, incoming);

    for path in &rules.preserve_collections {
        if let Some(existing_value) = get_path(existing, path) {
            let merged = match get_path(incoming, path) {
                Some(incoming_value) => union_collection(existing_value, incoming_value),
                None => existing_value.clone(),
            };
            set_path(&mut outgoing, path, merged);
        }
    }

    for path in &rules.preserve_scalars {
        preserve_scalar(&mut outgoing, existing, path);
    }
    if rules.status == StatusRule::Preserve {
        preserve_scalar(&mut outgoing, existing, &rules.status_path);
    }

    outgoing
}

/// Keep the existing value verbatim at `path`; the incoming value is
/// discarded entirely, including when the existing snapshot has none.
fn preserve_scalar(outgoing: &mut Value, existing: &Value, path: &FieldPath) {
    match get_path(existing, path) {
        Some(existing_value) => set_path(outgoing, path, existing_value.clone()),
        None => remove_path(outgoing, path),
    }
}

/// Patch-path mode: existing snapshot verbatim, with each listed path
/// overwritten by the incoming value at that path. Paths absent from the
/// incoming record are left untouched.
pub fn patch_record(existing: &Value, incoming: &Value, paths: &[FieldPath]) -> Value {
    let mut outgoing = existing.clone();
    for path in paths {
        if let Some(incoming_value) = get_path(incoming, path) {
            set_path(&mut outgoing, path, incoming_value.clone());
        }
    }
    outgoing
}
