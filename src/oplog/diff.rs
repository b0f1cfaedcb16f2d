//! Translates a version-2 diff-encoded oplog update (`{$v: 2, diff: {...}}`)
//! into either a standard `$set`/`$unset` update document or, for array
//! truncations, an aggregation pipeline update.

use bson::{
    doc,
    Bson,
    Document,
};

use crate::error::{
    ReplError,
    Result,
};

pub const VERSION_FIELD: &str = "$v";
pub const DIFF_FIELD: &str = "diff";
pub const SUPPORTED_DIFF_VERSION: i32 = 2;

/// The translated form of a diff update. [`DiffOutcome::Update`] is a plain
/// update document usable directly as the second argument to `update_one`;
/// [`DiffOutcome::Pipeline`] must be passed as an aggregation-pipeline
/// update instead.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    Update(Document),
    Pipeline(Vec<Document>),
}

/// Entry point: given the raw `o` field of a `u` oplog entry, verifies the
/// `$v: 2` marker and translates its `diff` sub-document.
pub fn translate_update_object(object: &Document) -> Result<DiffOutcome> {
    let version = object.get_i32(VERSION_FIELD).ok();
    if version != Some(SUPPORTED_DIFF_VERSION) {
        return Err(ReplError::UnsupportedDiffVersion(version));
    }
    let diff = object
        .get_document(DIFF_FIELD)
        .map_err(|_| ReplError::MalformedDiff(format!("missing diff object in {object:?}")))?;
    build_update_from_diff("", diff)
}

/// Recursive translation of one `diff` level. `prefix` is the dotted field
/// path accumulated by enclosing `s<field>` entries; empty at the top level.
pub fn build_update_from_diff(prefix: &str, diff: &Document) -> Result<DiffOutcome> {
    let mut result = Document::new();

    for (key, value) in diff.iter() {
        if key == "d" {
            let fields = as_document(value, key)?;
            merge_operator(&mut result, "$unset", combine_prefix(prefix, fields));
        } else if key == "i" || key == "u" {
            let fields = as_document(value, key)?;
            merge_operator(&mut result, "$set", combine_prefix(prefix, fields));
        } else if key.len() > 1 && key.starts_with('s') {
            let field = &key[1..];
            let nested_prefix = if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{prefix}.{field}")
            };
            let nested = as_document(value, key)?;
            match build_update_from_diff(&nested_prefix, nested)? {
                // A nested truncation pipeline supersedes everything
                // accumulated at this level, matching the source diff
                // format's rule that `l` is exclusive within its own
                // sub-document.
                DiffOutcome::Pipeline(p) => return Ok(DiffOutcome::Pipeline(p)),
                DiffOutcome::Update(nested_doc) => {
                    for (op, fields) in nested_doc.iter() {
                        let fields = fields
                            .as_document()
                            .cloned()
                            .ok_or_else(|| ReplError::MalformedDiff(format!("expected {op} to be a document")))?;
                        merge_operator(&mut result, op, fields);
                    }
                },
            }
        } else if key.len() > 1 && key.starts_with('u') {
            let field = &key[1..];
            let path = if prefix.is_empty() {
                field.to_string()
            } else {
                format!("{prefix}.{field}")
            };
            merge_operator(&mut result, "$set", doc! { path: value.clone() });
        } else if key == "l" {
            if !result.is_empty() {
                return Err(ReplError::MalformedDiff(format!(
                    "array-length truncation `l` must be the sole key in its diff level: {diff:?}"
                )));
            }
            return Ok(DiffOutcome::Pipeline(vec![doc! {
                "$set": { prefix: { "$slice": [format!("${prefix}"), value.clone()] } }
            }]));
        } else if key == "a" && matches!(value, Bson::Boolean(true)) {
            continue;
        } else {
            return Err(ReplError::MalformedDiff(format!("unrecognized diff key `{key}` in {diff:?}")));
        }
    }

    Ok(DiffOutcome::Update(result))
}

fn as_document<'a>(value: &'a Bson, key: &str) -> Result<&'a Document> {
    value
        .as_document()
        .ok_or_else(|| ReplError::MalformedDiff(format!("expected `{key}` to be a document, got {value:?}")))
}

fn combine_prefix(prefix: &str, fields: &Document) -> Document {
    if prefix.is_empty() {
        return fields.clone();
    }
    let mut out = Document::new();
    for (k, v) in fields.iter() {
        out.insert(format!("{prefix}.{k}"), v.clone());
    }
    out
}

fn merge_operator(result: &mut Document, op: &str, fields: Document) {
    if let Ok(existing) = result.get_document_mut(op) {
        for (k, v) in fields {
            existing.insert(k, v);
        }
    } else {
        result.insert(op, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_v2_update() {
        let obj = doc! { "$v": 1i32, "diff": { "u": { "a": 1 } } };
        assert!(matches!(
            translate_update_object(&obj),
            Err(ReplError::UnsupportedDiffVersion(Some(1)))
        ));
    }

    #[test]
    fn translates_set_and_unset() {
        let obj = doc! {
            "$v": 2i32,
            "diff": { "d": { "count": false }, "u": { "name": "orange" }, "i": { "c": 11i32 } }
        };
        let outcome = translate_update_object(&obj).unwrap();
        match outcome {
            DiffOutcome::Update(doc) => {
                let set = doc.get_document("$set").unwrap();
                assert_eq!(set.get_str("name").unwrap(), "orange");
                assert_eq!(set.get_i32("c").unwrap(), 11);
                assert!(doc.get_document("$unset").unwrap().contains_key("count"));
            },
            DiffOutcome::Pipeline(_) => panic!("expected an update document"),
        }
    }

    #[test]
    fn translates_nested_subdocument_diff() {
        // { "d": { "count": false }, "u": { "name": "orange" }, "sbar": { "u": { "x": 1 } } }
        let obj = doc! {
            "$v": 2i32,
            "diff": {
                "u": { "name": "orange" },
                "sbar": { "u": { "x": 1i32 } },
            }
        };
        let outcome = translate_update_object(&obj).unwrap();
        match outcome {
            DiffOutcome::Update(doc) => {
                let set = doc.get_document("$set").unwrap();
                assert_eq!(set.get_str("name").unwrap(), "orange");
                assert_eq!(set.get_i32("bar.x").unwrap(), 1);
            },
            DiffOutcome::Pipeline(_) => panic!("expected an update document"),
        }
    }

    #[test]
    fn translates_nested_field_set() {
        let obj = doc! {
            "$v": 2i32,
            "diff": { "u2": "replaced-at-index-2" }
        };
        let outcome = translate_update_object(&obj).unwrap();
        match outcome {
            DiffOutcome::Update(doc) => {
                let set = doc.get_document("$set").unwrap();
                assert_eq!(set.get_str("2").unwrap(), "replaced-at-index-2");
            },
            DiffOutcome::Pipeline(_) => panic!("expected an update document"),
        }
    }

    #[test]
    fn array_truncation_becomes_a_pipeline() {
        let obj = doc! {
            "$v": 2i32,
            "diff": { "stags": { "l": 3i32 } }
        };
        let outcome = translate_update_object(&obj).unwrap();
        match outcome {
            DiffOutcome::Pipeline(stages) => {
                assert_eq!(stages.len(), 1);
                let set = stages[0].get_document("$set").unwrap();
                let slice = set.get_document("tags").unwrap().get_array("$slice").unwrap();
                assert_eq!(slice[0], Bson::String("$tags".to_string()));
                assert_eq!(slice[1], Bson::Int32(3));
            },
            DiffOutcome::Update(_) => panic!("expected a pipeline"),
        }
    }

    #[test]
    fn array_marker_is_ignored() {
        let obj = doc! {
            "$v": 2i32,
            "diff": { "a": true, "u": { "x": 1i32 } }
        };
        let outcome = translate_update_object(&obj).unwrap();
        assert!(matches!(outcome, DiffOutcome::Update(_)));
    }

    #[test]
    fn rejects_truncation_mixed_with_other_keys() {
        let diff = doc! { "u": { "x": 1i32 }, "l": 2i32 };
        assert!(build_update_from_diff("", &diff).is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        let diff = doc! { "zzz": 1i32 };
        assert!(build_update_from_diff("", &diff).is_err());
    }
}
