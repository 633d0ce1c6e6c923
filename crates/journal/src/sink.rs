use crate::{lock, Entry};
use std::fmt::Write as _;
use std::sync::Mutex;

/// The in-memory journal sink: an append-only list of entries, in the
/// order their sections closed.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<Entry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: Entry) {
        tracing::trace!(
            agent_id = %entry.agent_id,
            instance_id = %entry.instance_id,
            entry_id = %entry.entry_id,
            "journal entry"
        );
        lock(&self.entries).push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        lock(&self.entries).clone()
    }

    /// All entries of one agent, in append order.
    pub fn for_agent(&self, agent_id: &str) -> Vec<Entry> {
        lock(&self.entries)
            .iter()
            .filter(|entry| entry.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

/// Render entries for offline inspection, one block per entry with its
/// fiber position, side effects, and output.
pub fn format_entries(entries: &[Entry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "{}:", entry.instance_id);
        let _ = writeln!(
            out,
            "    {}({})",
            entry.entry_id,
            serde_json_compact(&entry.input.to_json())
        );
        let _ = writeln!(
            out,
            "        FIBER {} DEPTH {}",
            entry.fiber_id, entry.fiber_depth
        );
        let effects = entry.side_effects.to_json();
        if effects.as_array().is_some_and(|list| !list.is_empty()) {
            let _ = writeln!(out, "        SIDE EFFECTS: {}", serde_json_compact(&effects));
        }
        let _ = writeln!(
            out,
            "        RETURN: {}\n",
            serde_json_compact(&entry.output.to_json())
        );
    }
    out
}

fn serde_json_compact(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<unrenderable>".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FiberId, InstanceId, JournalId};
    use snapshot::Tree;

    fn entry(agent_id: &str, entry_id: &str) -> Entry {
        Entry {
            agent_id: agent_id.to_string(),
            instance_id: InstanceId::Recorder(JournalId::root(agent_id)),
            entry_id: entry_id.to_string(),
            fiber_id: FiberId::generate(),
            fiber_depth: 0,
            input: Tree::Null,
            side_effects: Tree::List(vec![]),
            output: Tree::Null,
        }
    }

    #[test]
    fn sink_filters_by_agent_in_append_order() {
        let sink = MemorySink::new();
        sink.append(entry("w1", "initiate"));
        sink.append(entry("w2", "initiate"));
        sink.append(entry("w1", "announced"));

        let w1 = sink.for_agent("w1");
        assert_eq!(
            w1.iter().map(|e| e.entry_id.as_str()).collect::<Vec<_>>(),
            vec!["initiate", "announced"]
        );
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn formatting_is_one_block_per_entry() {
        let rendered = format_entries(&[entry("w1", "initiate")]);
        assert!(rendered.contains("w1:"));
        assert!(rendered.contains("initiate(null)"));
        assert!(rendered.contains("FIBER "));
    }
}
