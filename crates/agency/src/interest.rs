use crate::protocols::ProtocolFactory;
use crate::lock;
use messaging::Binding;
use std::sync::{Arc, Mutex};

/// Whether an interest accepts conversations from anyone in the shard
/// (public, backed by a broker binding on the protocol id) or only
/// messages already addressed to the agent (private, no binding).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InterestType {
    Public,
    Private,
}

/// A registered interest: the factory that will accept new conversations,
/// plus the broker binding a public interest holds until revoked.
pub struct Interest {
    pub factory: Arc<dyn ProtocolFactory>,
    binding: Mutex<Option<Arc<dyn Binding>>>,
}

impl Interest {
    pub(crate) fn new(factory: Arc<dyn ProtocolFactory>) -> Self {
        Self {
            factory,
            binding: Mutex::new(None),
        }
    }

    pub(crate) fn attach_binding(&self, binding: Arc<dyn Binding>) {
        *lock(&self.binding) = Some(binding);
    }

    pub fn has_binding(&self) -> bool {
        lock(&self.binding)
            .as_ref()
            .is_some_and(|binding| !binding.is_revoked())
    }

    /// Drop the binding, if any. Idempotent.
    pub(crate) fn revoke(&self) {
        if let Some(binding) = lock(&self.binding).take() {
            binding.revoke();
        }
    }
}
