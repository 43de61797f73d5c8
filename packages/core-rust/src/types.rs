use serde_json::{Map, Value};

/// Open, dynamically-keyed document exchanged between microservices.
///
/// Used for both service parameters and result payloads. The field set is
/// not statically typed; callers agree on keys by convention.
pub type DataObject = Map<String, Value>;

/// Builds a [`DataObject`] from `(key, value)` pairs.
#[must_use]
pub fn data_object<K, V, I>(entries: I) -> DataObject
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_object_from_pairs() {
        let obj = data_object([("testParam", "ok"), ("other", "x")]);
        assert_eq!(obj.get("testParam"), Some(&Value::from("ok")));
        assert_eq!(obj.len(), 2);
    }
}
