//! Field access shared by every transform, and the generic fallback.

use kollect_core::{prefixed_uid, EdgeType, Node, TransformError};
use serde_json::Value;

use crate::edges::EdgeRules;
use crate::{TransformContext, TransformOutput};

/// Metadata key holding the controller owner's prefixed UID.
pub const OWNER_UID: &str = "OwnerUID";

pub(crate) fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, key| cur.get(key))?.as_str().filter(|s| !s.is_empty())
}

pub(crate) fn i64_at(v: &Value, path: &[&str]) -> Option<i64> {
    path.iter().try_fold(v, |cur, key| cur.get(key))?.as_i64()
}

pub(crate) fn bool_at(v: &Value, path: &[&str]) -> Option<bool> {
    path.iter().try_fold(v, |cur, key| cur.get(key))?.as_bool()
}

pub(crate) fn array_at<'a>(v: &'a Value, path: &[&str]) -> &'a [Value] {
    path.iter()
        .try_fold(v, |cur, key| cur.get(key))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Node with the properties every resource has, plus its owner edges.
pub fn common(ctx: &TransformContext, raw: &Value) -> Result<(Node, EdgeRules), TransformError> {
    let meta = raw.get("metadata").ok_or(TransformError::MissingField("metadata"))?;
    let uid = str_at(meta, &["uid"]).ok_or(TransformError::MissingField("metadata.uid"))?;
    let kind = str_at(raw, &["kind"]).ok_or(TransformError::MissingField("kind"))?;
    let api_version = str_at(raw, &["apiVersion"]).unwrap_or("");

    let mut node = Node::new(prefixed_uid(&ctx.cluster, uid))
        .with_property("kind", kind)
        .with_property("name", str_at(meta, &["name"]).unwrap_or(""))
        .with_property("apiversion", api_version)
        .with_property("cluster", ctx.cluster.as_str());
    if let Some((group, _)) = api_version.rsplit_once('/') {
        node = node.with_property("apigroup", group);
    }
    if let Some(ns) = str_at(meta, &["namespace"]) {
        node = node.with_property("namespace", ns);
    }
    if let Some(created) = str_at(meta, &["creationTimestamp"]) {
        node = node.with_property("created", created);
    }
    match meta.get("labels") {
        Some(Value::Object(labels)) if !labels.is_empty() => {
            node = node.with_property("label", Value::Object(labels.clone()));
        }
        Some(Value::Object(_)) | Some(Value::Null) | None => {}
        Some(_) => {
            return Err(TransformError::Malformed { field: "metadata.labels", reason: "not a map".into() })
        }
    }

    let mut owners = Vec::new();
    for owner in array_at(meta, &["ownerReferences"]) {
        let Some(owner_uid) = str_at(owner, &["uid"]) else { continue };
        let owner_uid = prefixed_uid(&ctx.cluster, owner_uid);
        if bool_at(owner, &["controller"]).unwrap_or(false) {
            node.metadata.insert(OWNER_UID.to_string(), owner_uid.clone());
        }
        owners.push(owner_uid);
    }
    let mut rules = EdgeRules::for_node(&node);
    for owner in owners {
        rules.to_uid(owner, EdgeType::OwnedBy);
    }
    Ok((node, rules))
}

/// Fallback for kinds without a dedicated transform.
pub fn generic(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (node, rules) = common(ctx, raw)?;
    Ok(TransformOutput { node, edges: rules.into_fn() })
}

