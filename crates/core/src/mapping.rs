//! Helpers for building `kubernetes.*` variable trees.

use serde_json::{Map, Value};

/// String-keyed variable tree.
pub type Mapping = Map<String, Value>;

/// Insert `value` at a dotted `key`, creating intermediate objects.
///
/// A non-object value found on the way is moved under a `value` key so that
/// neither entry is lost (`a=1` then `a.b=2` yields `{a: {value: 1, b: 2}}`).
/// Same when the final key already holds an object.
pub fn safe_put(map: &mut Mapping, key: &str, value: Value) {
    let mut parts = key.split('.').peekable();
    let mut cur = map;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            match cur.get_mut(part) {
                Some(Value::Object(inner)) => { inner.insert("value".to_string(), value); }
                _ => { cur.insert(part.to_string(), value); }
            }
            return;
        }
        let slot = cur.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            let old = slot.take();
            let mut inner = Map::new();
            inner.insert("value".to_string(), old);
            *slot = Value::Object(inner);
        }
        cur = match slot {
            Value::Object(inner) => inner,
            _ => return,
        };
    }
}

/// Check that no key in the tree is empty; returns the dotted path of the
/// first offending key.
pub fn find_empty_key(map: &Mapping) -> Option<String> {
    fn walk(map: &Mapping, base: &str) -> Option<String> {
        for (k, v) in map {
            let path = if base.is_empty() { k.clone() } else { format!("{}.{}", base, k) };
            if k.is_empty() { return Some(path); }
            if let Value::Object(inner) = v {
                if let Some(p) = walk(inner, &path) { return Some(p); }
            }
        }
        None
    }
    walk(map, "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nests_dotted_keys() {
        let mut m = Mapping::new();
        safe_put(&mut m, "app.kubernetes.io/name", json!("web"));
        safe_put(&mut m, "plain", json!("x"));
        assert_eq!(Value::Object(m), json!({"app": {"kubernetes": {"io/name": "web"}}, "plain": "x"}));
    }

    #[test]
    fn keeps_both_values_on_conflict() {
        let mut m = Mapping::new();
        safe_put(&mut m, "a", json!("1"));
        safe_put(&mut m, "a.b", json!("2"));
        assert_eq!(Value::Object(m.clone()), json!({"a": {"value": "1", "b": "2"}}));
        safe_put(&mut m, "a", json!("3"));
        assert_eq!(Value::Object(m), json!({"a": {"value": "3", "b": "2"}}));
    }

    #[test]
    fn finds_empty_keys() {
        let mut m = Mapping::new();
        safe_put(&mut m, "ok.fine", json!(1));
        assert_eq!(find_empty_key(&m), None);
        safe_put(&mut m, "ok..bad", json!(1));
        assert_eq!(find_empty_key(&m).as_deref(), Some("ok."));
    }
}
