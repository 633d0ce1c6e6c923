use crate::{Error, Live, Resolver, Snapshot, Tree};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Rebuild a live value graph from tree form.
///
/// `Ref`/`Deref` pairs restore sharing (including cycles); `External`
/// nodes resolve through `resolver` to replay-local replicas; `Instance`
/// nodes revive as [`RestoredInstance`] handles.
pub fn unpack(tree: &Tree, resolver: &dyn Resolver) -> Result<Live, Error> {
    let mut table = HashMap::new();
    unpack_inner(tree, resolver, &mut table)
}

fn unpack_inner(
    tree: &Tree,
    resolver: &dyn Resolver,
    table: &mut HashMap<u32, Arc<Mutex<Live>>>,
) -> Result<Live, Error> {
    Ok(match tree {
        Tree::Null => Live::Null,
        Tree::Bool(v) => Live::Bool(*v),
        Tree::Int(v) => Live::Int(*v),
        Tree::Float(v) => Live::Float(*v),
        Tree::Str(v) => Live::Str(v.clone()),
        Tree::List(items) => Live::List(
            items
                .iter()
                .map(|item| unpack_inner(item, resolver, table))
                .collect::<Result<_, _>>()?,
        ),
        Tree::Map(pairs) => Live::Map(
            pairs
                .iter()
                .map(|(k, v)| {
                    Ok((
                        unpack_inner(k, resolver, table)?,
                        unpack_inner(v, resolver, table)?,
                    ))
                })
                .collect::<Result<_, _>>()?,
        ),
        Tree::Ref(id, body) => {
            // Register the placeholder before descending so that nested
            // dereferences of this id resolve to the same node.
            let node = Arc::new(Mutex::new(Live::Null));
            table.insert(*id, node.clone());
            let inner = unpack_inner(body, resolver, table)?;
            *node.lock().unwrap() = inner;
            Live::Shared(node)
        }
        Tree::Deref(id) => {
            let node = table.get(id).ok_or(Error::UnresolvedRef(*id))?;
            Live::Shared(node.clone())
        }
        Tree::External(journal_ref) => resolver
            .lookup(journal_ref)
            .ok_or_else(|| Error::UnknownExternal(journal_ref.clone()))?,
        Tree::Instance { type_name, body } => Live::Handle(Arc::new(RestoredInstance {
            type_name: type_name.clone(),
            body: unpack_inner(body, resolver, table)?,
        })),
    })
}

/// The revived form of an `Instance` node: a handle carrying the original
/// type name and snapshot body, with no behavior.
pub struct RestoredInstance {
    type_name: String,
    body: Live,
}

impl Snapshot for RestoredInstance {
    fn type_name(&self) -> &str {
        &self.type_name
    }
    fn snapshot(&self) -> Live {
        self.body.clone()
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod test {
    use super::unpack;
    use crate::{convert, Live, NoExternalizer, NoResolver, Resolver, Tree};

    // Serialize ∘ Deserialize is the identity on tree form.
    fn round_trips(tree: Tree) {
        let live = unpack(&tree, &NoResolver).unwrap();
        assert_eq!(convert(&live, &NoExternalizer), tree);
    }

    #[test]
    fn round_trip_scalars_and_containers() {
        round_trips(Tree::List(vec![
            Tree::Null,
            Tree::Bool(false),
            Tree::Int(7),
            Tree::Float(0.5),
            Tree::str("z"),
            Tree::Map(vec![(Tree::str("k"), Tree::Int(1))]),
        ]));
    }

    #[test]
    fn round_trip_sharing() {
        round_trips(Tree::List(vec![
            Tree::Ref(1, Box::new(Tree::List(vec![]))),
            Tree::Deref(1),
            Tree::Deref(1),
        ]));
    }

    #[test]
    fn round_trip_cycle() {
        round_trips(Tree::Ref(
            1,
            Box::new(Tree::List(vec![Tree::Deref(1), Tree::Int(3)])),
        ));
    }

    #[test]
    fn round_trip_instance() {
        round_trips(Tree::Instance {
            type_name: "dummy".to_string(),
            body: Box::new(Tree::Map(vec![(Tree::str("int"), Tree::Int(42))])),
        });
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let err = unpack(&Tree::Deref(9), &NoResolver).unwrap_err();
        assert!(matches!(err, crate::Error::UnresolvedRef(9)));
    }

    #[test]
    fn external_resolves_through_the_resolver() {
        struct Fixed;
        impl Resolver for Fixed {
            fn lookup(&self, journal_ref: &str) -> Option<Live> {
                (journal_ref == "w1/2").then_some(Live::Int(11))
            }
        }

        let live = unpack(&Tree::External("w1/2".to_string()), &Fixed).unwrap();
        assert!(matches!(live, Live::Int(11)));

        let err = unpack(&Tree::External("w9".to_string()), &Fixed).unwrap_err();
        assert!(matches!(err, crate::Error::UnknownExternal(_)));
    }
}
