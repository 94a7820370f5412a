//! Helpers over rendered release manifests
//!
//! Rendered manifests are multi-document YAML buffers. The post-renderer
//! edits them document by document; the kubectl marking path groups the
//! contained objects by namespace.

use std::collections::BTreeMap;

use serde_yaml::Value;

/// Parse a multi-document YAML buffer, dropping empty documents
pub fn parse_documents(manifest: &str) -> Vec<Value> {
    use serde::Deserialize;
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        match Value::deserialize(document) {
            Ok(Value::Null) => {}
            Ok(value) => docs.push(value),
            Err(_) => {}
        }
    }
    docs
}

/// Serialize documents back into one buffer with `---` separators
pub fn serialize_documents(docs: &[Value]) -> String {
    let mut out = String::new();
    for doc in docs {
        if let Ok(yaml) = serde_yaml::to_string(doc) {
            out.push_str("---\n");
            out.push_str(&yaml);
        }
    }
    out
}

/// Kind of a document, when present
pub fn doc_kind(doc: &Value) -> Option<&str> {
    doc.get("kind").and_then(Value::as_str)
}

/// Name of a document, when present
pub fn doc_name(doc: &Value) -> Option<&str> {
    doc.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
}

/// Namespace of a document, when present
pub fn doc_namespace(doc: &Value) -> Option<&str> {
    doc.get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
}

/// Group the objects of a manifest by namespace as `kind/name` references,
/// the shape `kubectl` takes on the command line. Objects without an
/// explicit namespace fall into the release's namespace.
pub fn namespaced_resource_map(
    docs: &[Value],
    default_namespace: &str,
) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for doc in docs {
        let (Some(kind), Some(name)) = (doc_kind(doc), doc_name(doc)) else {
            continue;
        };
        let namespace = doc_namespace(doc).unwrap_or(default_namespace);
        map.entry(namespace.to_string())
            .or_default()
            .push(format!("{}/{}", kind.to_lowercase(), name));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: podinfo
---
apiVersion: v1
kind: Service
metadata:
  name: podinfo
  namespace: edge
---
"#;

    #[test]
    fn parses_documents_and_skips_empty_ones() {
        let docs = parse_documents(MANIFEST);
        assert_eq!(docs.len(), 2);
        assert_eq!(doc_kind(&docs[0]), Some("Deployment"));
        assert_eq!(doc_name(&docs[1]), Some("podinfo"));
        assert_eq!(doc_namespace(&docs[1]), Some("edge"));
    }

    #[test]
    fn round_trip_is_stable() {
        let docs = parse_documents(MANIFEST);
        let serialized = serialize_documents(&docs);
        let docs_again = parse_documents(&serialized);
        assert_eq!(docs, docs_again);
        assert_eq!(serialized, serialize_documents(&docs_again));
    }

    /// Objects without a namespace land in the release namespace; explicit
    /// namespaces are preserved
    #[test]
    fn resource_map_groups_by_namespace() {
        let docs = parse_documents(MANIFEST);
        let map = namespaced_resource_map(&docs, "apps");

        assert_eq!(map["apps"], vec!["deployment/podinfo".to_string()]);
        assert_eq!(map["edge"], vec!["service/podinfo".to_string()]);
    }
}
