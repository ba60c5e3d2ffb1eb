//! Object metadata helpers: finalizers, annotations, timestamps and owner
//! references.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::Resource;

/// Returns true if the object carries the finalizer.
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Adds a finalizer; returns true if the object changed.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes a finalizer; returns true if the object changed.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

/// Returns true once the object has a deletion timestamp.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Returns the object's generation, 0 when unset.
pub fn generation<K: Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or_default()
}

/// Returns the object's uid, empty when unset.
pub fn uid<K: Resource>(obj: &K) -> &str {
    obj.meta().uid.as_deref().unwrap_or_default()
}

/// Returns an annotation value.
pub fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta().annotations.as_ref()?.get(key).map(String::as_str)
}

/// Sets an annotation; returns true if the object changed.
pub fn set_annotation<K: Resource>(obj: &mut K, key: &str, value: &str) -> bool {
    let annotations = obj.meta_mut().annotations.get_or_insert_with(Default::default);
    if annotations.get(key).is_some_and(|v| v == value) {
        return false;
    }
    annotations.insert(key.to_string(), value.to_string());
    true
}

/// Returns a label value.
pub fn label<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta().labels.as_ref()?.get(key).map(String::as_str)
}

/// Converts an API timestamp into a chrono timestamp.
pub fn to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let text = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(text.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Converts a chrono timestamp into an API timestamp.
pub fn from_utc(time: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(
        time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    ))
    .ok()
}

/// Returns how long ago the object was created.
pub fn age<K: Resource>(obj: &K, now: DateTime<Utc>) -> chrono::Duration {
    obj.meta()
        .creation_timestamp
        .as_ref()
        .and_then(to_utc)
        .map(|created| now - created)
        .unwrap_or_else(chrono::Duration::zero)
}

/// Builds a controller owner reference pointing at the object.
pub fn controller_reference<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.meta().name.clone().unwrap_or_default(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_cvi;
    use chrono::TimeZone;

    #[test]
    fn test_finalizers() {
        let mut cvi = create_test_cvi("ubuntu");

        assert!(add_finalizer(&mut cvi, "a"));
        assert!(!add_finalizer(&mut cvi, "a"));
        assert!(has_finalizer(&cvi, "a"));
        assert!(remove_finalizer(&mut cvi, "a"));
        assert!(!remove_finalizer(&mut cvi, "a"));
    }

    #[test]
    fn test_time_conversion() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap();
        assert_eq!(from_utc(t).as_ref().and_then(to_utc), Some(t));
    }

    #[test]
    fn test_annotations() {
        let mut cvi = create_test_cvi("ubuntu");

        assert!(set_annotation(&mut cvi, "k", "v"));
        assert!(!set_annotation(&mut cvi, "k", "v"));
        assert_eq!(annotation(&cvi, "k"), Some("v"));
    }
}
