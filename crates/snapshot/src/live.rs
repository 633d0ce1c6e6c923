use crate::{Error, Snapshot};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// An in-memory value graph.
///
/// `Shared` nodes may be aliased from several places (and may form cycles);
/// their identity is the `Arc` pointer. `Handle` nodes reference live
/// objects which serialize either by stable id (when registered with the
/// externalizer) or by their snapshot value.
#[derive(Clone)]
pub enum Live {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Live>),
    Map(Vec<(Live, Live)>),
    Shared(Arc<Mutex<Live>>),
    Handle(Arc<dyn Snapshot>),
}

impl Live {
    pub fn shared(value: Live) -> Live {
        Live::Shared(Arc::new(Mutex::new(value)))
    }

    pub fn handle(object: Arc<dyn Snapshot>) -> Live {
        Live::Handle(object)
    }

    /// A map with string keys, the common case.
    pub fn record<I, V>(fields: I) -> Live
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Live>,
    {
        Live::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Live::Str(k.to_string()), v.into()))
                .collect(),
        )
    }

    /// Build a Live value from plain JSON. Objects become string-keyed
    /// maps in key order; no sharing is introduced.
    pub fn from_json(value: &serde_json::Value) -> Live {
        use serde_json::Value;
        match value {
            Value::Null => Live::Null,
            Value::Bool(b) => Live::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Live::Int(i),
                None => Live::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Live::Str(s.clone()),
            Value::Array(items) => Live::List(items.iter().map(Live::from_json).collect()),
            Value::Object(fields) => Live::Map(
                fields
                    .iter()
                    .map(|(k, v)| (Live::Str(k.clone()), Live::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render to plain JSON. Shared nodes are inlined; handles render
    /// their snapshot body. Fails on cyclic graphs and non-string map keys.
    pub fn to_json(&self) -> Result<serde_json::Value, Error> {
        let mut on_path = HashSet::new();
        self.to_json_inner(&mut on_path)
    }

    fn to_json_inner(&self, on_path: &mut HashSet<*const ()>) -> Result<serde_json::Value, Error> {
        use serde_json::Value;
        Ok(match self {
            Live::Null => Value::Null,
            Live::Bool(b) => Value::Bool(*b),
            Live::Int(i) => Value::from(*i),
            Live::Float(f) => Value::from(*f),
            Live::Str(s) => Value::String(s.clone()),
            Live::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.to_json_inner(on_path))
                    .collect::<Result<_, _>>()?,
            ),
            Live::Map(pairs) => {
                let mut fields = serde_json::Map::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let Live::Str(key) = key else {
                        return Err(Error::UnrenderableJson);
                    };
                    fields.insert(key.clone(), value.to_json_inner(on_path)?);
                }
                Value::Object(fields)
            }
            Live::Shared(node) => {
                let key = crate::shared_key(node);
                if !on_path.insert(key) {
                    return Err(Error::UnrenderableJson);
                }
                let inner = node.lock().unwrap().clone();
                let rendered = inner.to_json_inner(on_path)?;
                on_path.remove(&key);
                rendered
            }
            Live::Handle(handle) => handle.snapshot().to_json_inner(on_path)?,
        })
    }
}

impl From<bool> for Live {
    fn from(v: bool) -> Live {
        Live::Bool(v)
    }
}
impl From<i64> for Live {
    fn from(v: i64) -> Live {
        Live::Int(v)
    }
}
impl From<u32> for Live {
    fn from(v: u32) -> Live {
        Live::Int(v as i64)
    }
}
impl From<f64> for Live {
    fn from(v: f64) -> Live {
        Live::Float(v)
    }
}
impl From<&str> for Live {
    fn from(v: &str) -> Live {
        Live::Str(v.to_string())
    }
}
impl From<String> for Live {
    fn from(v: String) -> Live {
        Live::Str(v)
    }
}
impl<T: Into<Live>> From<Vec<T>> for Live {
    fn from(v: Vec<T>) -> Live {
        Live::List(v.into_iter().map(Into::into).collect())
    }
}
impl<T: Into<Live>> From<Option<T>> for Live {
    fn from(v: Option<T>) -> Live {
        match v {
            Some(v) => v.into(),
            None => Live::Null,
        }
    }
}

impl std::fmt::Debug for Live {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Live::Null => f.write_str("Null"),
            Live::Bool(v) => write!(f, "{v:?}"),
            Live::Int(v) => write!(f, "{v:?}"),
            Live::Float(v) => write!(f, "{v:?}"),
            Live::Str(v) => write!(f, "{v:?}"),
            Live::List(items) => f.debug_list().entries(items).finish(),
            Live::Map(pairs) => f.debug_map().entries(pairs.iter().map(|(k, v)| (k, v))).finish(),
            // Shared nodes may be cyclic; print identity, not content.
            Live::Shared(node) => write!(f, "Shared@{:?}", Arc::as_ptr(node)),
            Live::Handle(handle) => write!(f, "Handle({})", handle.type_name()),
        }
    }
}
