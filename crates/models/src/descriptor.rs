/// The persisted identity of an agent.
///
/// Serialized layout is `{doc_id, rev: "<index>-<hash>", document_type,
/// shard, ...payload}`. The revision is absent until the descriptor has
/// been written through the database; it is adopted from the store's
/// response and must never be fabricated locally.
#[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Descriptor {
    pub doc_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rev: Option<String>,
    pub document_type: String,
    pub shard: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Descriptor {
    pub fn new(
        doc_id: impl Into<String>,
        document_type: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev: None,
            document_type: document_type.into(),
            shard: shard.into(),
            payload: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Descriptor;

    #[test]
    fn payload_fields_flatten_into_the_document() {
        let mut desc = Descriptor::new("w1", "worker", "s");
        desc.payload
            .insert("capacity".to_string(), serde_json::json!(3));

        let doc = serde_json::to_value(&desc).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({
                "doc_id": "w1",
                "document_type": "worker",
                "shard": "s",
                "capacity": 3,
            })
        );

        let back: Descriptor = serde_json::from_value(doc).unwrap();
        assert_eq!(back, desc);
    }
}
