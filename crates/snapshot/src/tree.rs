/// The serialized form of a [`crate::Live`] graph.
///
/// Sharing is expressed by `Ref(n, body)` at the first occurrence and
/// `Deref(n)` afterwards; references are numbered in emission order from 1.
/// `External` carries the stable journal id of a registered recorder.
/// `Instance` is the by-value form of an unregistered handle.
#[derive(Clone, PartialEq)]
pub enum Tree {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Tree>),
    Map(Vec<(Tree, Tree)>),
    Ref(u32, Box<Tree>),
    Deref(u32),
    External(String),
    Instance { type_name: String, body: Box<Tree> },
}

impl Tree {
    pub fn str(value: impl Into<String>) -> Tree {
        Tree::Str(value.into())
    }

    /// Render as JSON for the offline journal stream. Reference and
    /// external nodes use reserved single-key objects.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Tree::Null => Value::Null,
            Tree::Bool(v) => Value::Bool(*v),
            Tree::Int(v) => Value::from(*v),
            Tree::Float(v) => Value::from(*v),
            Tree::Str(v) => Value::String(v.clone()),
            Tree::List(items) => Value::Array(items.iter().map(Tree::to_json).collect()),
            Tree::Map(pairs) => {
                if pairs.iter().all(|(k, _)| matches!(k, Tree::Str(_))) {
                    let mut fields = serde_json::Map::with_capacity(pairs.len());
                    for (key, value) in pairs {
                        let Tree::Str(key) = key else { unreachable!() };
                        fields.insert(key.clone(), value.to_json());
                    }
                    Value::Object(fields)
                } else {
                    json!({ "_pairs": pairs
                        .iter()
                        .map(|(k, v)| json!([k.to_json(), v.to_json()]))
                        .collect::<Vec<_>>() })
                }
            }
            Tree::Ref(n, body) => json!({"_ref": n, "_value": body.to_json()}),
            Tree::Deref(n) => json!({"_deref": n}),
            Tree::External(id) => json!({"_external": id}),
            Tree::Instance { type_name, body } => {
                json!({"_type": type_name, "_body": body.to_json()})
            }
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tree::Null => f.write_str("Null"),
            Tree::Bool(v) => write!(f, "{v:?}"),
            Tree::Int(v) => write!(f, "{v:?}"),
            Tree::Float(v) => write!(f, "{v:?}"),
            Tree::Str(v) => write!(f, "{v:?}"),
            Tree::List(items) => f.debug_list().entries(items).finish(),
            Tree::Map(pairs) => f.debug_map().entries(pairs.iter().map(|(k, v)| (k, v))).finish(),
            Tree::Ref(n, body) => write!(f, "Ref({n}, {body:?})"),
            Tree::Deref(n) => write!(f, "Deref({n})"),
            Tree::External(id) => write!(f, "External({id:?})"),
            Tree::Instance { type_name, body } => write!(f, "Instance({type_name}, {body:?})"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Tree;
    use serde_json::json;

    #[test]
    fn json_rendering_of_reference_nodes() {
        let tree = Tree::List(vec![
            Tree::Ref(1, Box::new(Tree::List(vec![]))),
            Tree::Deref(1),
            Tree::External("w1/2".to_string()),
        ]);
        assert_eq!(
            tree.to_json(),
            json!([
                {"_ref": 1, "_value": []},
                {"_deref": 1},
                {"_external": "w1/2"},
            ])
        );
    }

    #[test]
    fn non_string_keys_fall_back_to_pair_lists() {
        let tree = Tree::Map(vec![(Tree::Int(1), Tree::str("one"))]);
        assert_eq!(tree.to_json(), json!({"_pairs": [[1, "one"]]}));
    }
}
