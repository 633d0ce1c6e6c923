use crate::{handle_key, shared_key, Externalizer, Live, Snapshot, Tree};
use std::collections::HashMap;
use std::sync::Arc;

/// Serialize a value graph to tree form.
///
/// Registered recorders become `External(journal_id)`; other handles are
/// wrapped as `Instance{type_name, body}`. Nodes occurring more than once
/// (including via cycles) become `Ref`/`Deref` pairs.
pub fn convert(value: &Live, externalizer: &dyn Externalizer) -> Tree {
    Packer::new(value, externalizer, Wrapping::Instance).pack(value)
}

/// Like [`convert`], but unregistered handles are frozen to their bare
/// snapshot body, without the `Instance` wrapper. Used for entry outputs.
pub fn freeze(value: &Live, externalizer: &dyn Externalizer) -> Tree {
    Packer::new(value, externalizer, Wrapping::Bare).pack(value)
}

#[derive(Copy, Clone, PartialEq)]
enum Wrapping {
    Instance,
    Bare,
}

struct Packer<'e> {
    externalizer: &'e dyn Externalizer,
    wrapping: Wrapping,
    // Occurrence counts from the identity scan, keyed by node pointer.
    counts: HashMap<*const (), u32>,
    // Memoized handle snapshots, so both passes see one body.
    bodies: HashMap<*const (), Live>,
    // Reference ids assigned during emission, numbered from 1.
    refs: HashMap<*const (), u32>,
    next_ref: u32,
}

impl<'e> Packer<'e> {
    fn new(root: &Live, externalizer: &'e dyn Externalizer, wrapping: Wrapping) -> Self {
        let mut packer = Self {
            externalizer,
            wrapping,
            counts: HashMap::new(),
            bodies: HashMap::new(),
            refs: HashMap::new(),
            next_ref: 1,
        };
        packer.scan(root);
        packer
    }

    // Pass one: count occurrences of aliasable nodes. Recursion stops at
    // already-seen nodes, which also terminates cycles.
    fn scan(&mut self, value: &Live) {
        match value {
            Live::Null | Live::Bool(_) | Live::Int(_) | Live::Float(_) | Live::Str(_) => (),
            Live::List(items) => items.iter().for_each(|item| self.scan(item)),
            Live::Map(pairs) => pairs.iter().for_each(|(k, v)| {
                self.scan(k);
                self.scan(v);
            }),
            Live::Shared(node) => {
                let key = shared_key(node);
                let count = self.counts.entry(key).or_insert(0);
                *count += 1;
                if *count == 1 {
                    let inner = node.lock().unwrap().clone();
                    self.scan(&inner);
                }
            }
            Live::Handle(handle) => {
                if self.identify(handle).is_some() {
                    return;
                }
                let key = handle_key(handle);
                let count = self.counts.entry(key).or_insert(0);
                *count += 1;
                if *count == 1 {
                    let body = handle.snapshot();
                    self.scan(&body);
                    self.bodies.insert(key, body);
                }
            }
        }
    }

    // Pass two: linearize. The reference id is registered before the body
    // is packed so that cyclic re-entries emit a Deref.
    fn pack(&mut self, value: &Live) -> Tree {
        match value {
            Live::Null => Tree::Null,
            Live::Bool(v) => Tree::Bool(*v),
            Live::Int(v) => Tree::Int(*v),
            Live::Float(v) => Tree::Float(*v),
            Live::Str(v) => Tree::Str(v.clone()),
            Live::List(items) => Tree::List(items.iter().map(|item| self.pack(item)).collect()),
            Live::Map(pairs) => Tree::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (self.pack(k), self.pack(v)))
                    .collect(),
            ),
            Live::Shared(node) => {
                let key = shared_key(node);
                match self.reference(key) {
                    Occurrence::Single => {
                        let inner = node.lock().unwrap().clone();
                        self.pack(&inner)
                    }
                    Occurrence::First(id) => {
                        let inner = node.lock().unwrap().clone();
                        Tree::Ref(id, Box::new(self.pack(&inner)))
                    }
                    Occurrence::Again(id) => Tree::Deref(id),
                }
            }
            Live::Handle(handle) => {
                if let Some(journal_ref) = self.identify(handle) {
                    return Tree::External(journal_ref);
                }
                let key = handle_key(handle);
                let wrap = |packer: &mut Self, body: Tree| match packer.wrapping {
                    Wrapping::Instance => Tree::Instance {
                        type_name: handle.type_name().to_string(),
                        body: Box::new(body),
                    },
                    Wrapping::Bare => body,
                };
                match self.reference(key) {
                    Occurrence::Single => {
                        let body = self.body(key);
                        let body = self.pack(&body);
                        wrap(self, body)
                    }
                    Occurrence::First(id) => {
                        let body = self.body(key);
                        let body = self.pack(&body);
                        let wrapped = wrap(self, body);
                        Tree::Ref(id, Box::new(wrapped))
                    }
                    Occurrence::Again(id) => Tree::Deref(id),
                }
            }
        }
    }

    fn identify(&self, handle: &Arc<dyn Snapshot>) -> Option<String> {
        self.externalizer.identify(handle)
    }

    fn body(&self, key: *const ()) -> Live {
        // Present for every non-external handle seen by the scan.
        self.bodies.get(&key).cloned().unwrap_or(Live::Null)
    }

    fn reference(&mut self, key: *const ()) -> Occurrence {
        if self.counts.get(&key).copied().unwrap_or(0) < 2 {
            return Occurrence::Single;
        }
        if let Some(id) = self.refs.get(&key) {
            return Occurrence::Again(*id);
        }
        let id = self.next_ref;
        self.next_ref += 1;
        self.refs.insert(key, id);
        Occurrence::First(id)
    }
}

enum Occurrence {
    Single,
    First(u32),
    Again(u32),
}

#[cfg(test)]
mod test {
    use super::{convert, freeze};
    use crate::{Live, NoExternalizer, Snapshot, Tree};
    use std::sync::{Arc, Mutex};

    fn pack(value: &Live) -> Tree {
        convert(value, &NoExternalizer)
    }

    #[test]
    fn scalars_and_containers_pass_through() {
        let value = Live::List(vec![
            Live::Null,
            Live::Bool(true),
            Live::Int(-42),
            Live::Float(3.1415926),
            Live::Str("dummy".to_string()),
            Live::Map(vec![(Live::Int(1), Live::Int(2))]),
        ]);
        assert_eq!(
            pack(&value),
            Tree::List(vec![
                Tree::Null,
                Tree::Bool(true),
                Tree::Int(-42),
                Tree::Float(3.1415926),
                Tree::str("dummy"),
                Tree::Map(vec![(Tree::Int(1), Tree::Int(2))]),
            ])
        );
    }

    #[test]
    fn shared_node_emits_ref_then_deref() {
        let a = Live::shared(Live::List(vec![]));
        let value = Live::List(vec![a.clone(), a]);
        assert_eq!(
            pack(&value),
            Tree::List(vec![
                Tree::Ref(1, Box::new(Tree::List(vec![]))),
                Tree::Deref(1),
            ])
        );
    }

    #[test]
    fn singly_used_shared_node_inlines() {
        let value = Live::List(vec![Live::shared(Live::Int(7))]);
        assert_eq!(pack(&value), Tree::List(vec![Tree::Int(7)]));
    }

    #[test]
    fn shared_node_in_map_value_then_alias() {
        let a = Live::shared(Live::Str("x".to_string()));
        let value = Live::List(vec![
            Live::Map(vec![(Live::Int(1), a.clone())]),
            a,
        ]);
        assert_eq!(
            pack(&value),
            Tree::List(vec![
                Tree::Map(vec![(Tree::Int(1), Tree::Ref(1, Box::new(Tree::str("x"))))]),
                Tree::Deref(1),
            ])
        );
    }

    #[test]
    fn self_reference_emits_cycle() {
        let node = Arc::new(Mutex::new(Live::Null));
        *node.lock().unwrap() = Live::List(vec![Live::Shared(node.clone())]);
        let value = Live::Shared(node);

        assert_eq!(
            pack(&value),
            Tree::Ref(1, Box::new(Tree::List(vec![Tree::Deref(1)])))
        );
    }

    #[test]
    fn multiple_references_number_in_emission_order() {
        let a = Live::shared(Live::List(vec![]));
        let b = Live::shared(Live::List(vec![a.clone()]));
        let value = Live::List(vec![a.clone(), b.clone(), Live::List(vec![a, b])]);
        assert_eq!(
            pack(&value),
            Tree::List(vec![
                Tree::Ref(1, Box::new(Tree::List(vec![]))),
                Tree::Ref(2, Box::new(Tree::List(vec![Tree::Deref(1)]))),
                Tree::List(vec![Tree::Deref(1), Tree::Deref(2)]),
            ])
        );
    }

    struct Dummy;

    impl Snapshot for Dummy {
        fn type_name(&self) -> &str {
            "dummy"
        }
        fn snapshot(&self) -> Live {
            Live::record([("int", Live::Int(42)), ("none", Live::Null)])
        }
        fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn unregistered_handle_converts_to_instance_and_freezes_bare() {
        let value = Live::handle(Arc::new(Dummy));
        let body = Tree::Map(vec![
            (Tree::str("int"), Tree::Int(42)),
            (Tree::str("none"), Tree::Null),
        ]);

        assert_eq!(
            convert(&value, &NoExternalizer),
            Tree::Instance {
                type_name: "dummy".to_string(),
                body: Box::new(body.clone()),
            }
        );
        assert_eq!(freeze(&value, &NoExternalizer), body);
    }

    struct ById(&'static str);

    impl crate::Externalizer for ById {
        fn identify(&self, handle: &Arc<dyn Snapshot>) -> Option<String> {
            (handle.type_name() == self.0).then(|| "j1".to_string())
        }
    }

    #[test]
    fn registered_handle_externalizes() {
        let value = Live::List(vec![
            Live::handle(Arc::new(Dummy)),
            Live::handle(Arc::new(Dummy)),
        ]);
        assert_eq!(
            convert(&value, &ById("dummy")),
            Tree::List(vec![
                Tree::External("j1".to_string()),
                Tree::External("j1".to_string()),
            ])
        );
    }
}
