use crate::Error;
use snapshot::{convert, unpack, Externalizer, Live, Resolver, Tree};

/// A named side effect captured inside a journal section: an external
/// interaction (time, descriptor copy, messaging, persistence) whose
/// result replay substitutes instead of repeating the interaction.
#[derive(Clone, Debug)]
pub struct SideEffect {
    pub effect_id: String,
    pub args: Live,
    /// Effects performed while this one was running.
    pub nested: Vec<SideEffect>,
    pub outcome: EffectOutcome,
}

#[derive(Clone, Debug)]
pub enum EffectOutcome {
    Ok(Live),
    Failed(String),
}

/// Snapshot captured side effects to tree form for an entry.
pub fn pack_effects(effects: &[SideEffect], ext: &dyn Externalizer) -> Tree {
    Tree::List(effects.iter().map(|effect| pack_one(effect, ext)).collect())
}

fn pack_one(effect: &SideEffect, ext: &dyn Externalizer) -> Tree {
    let outcome = match &effect.outcome {
        EffectOutcome::Ok(value) => Tree::List(vec![Tree::str("ok"), convert(value, ext)]),
        EffectOutcome::Failed(message) => {
            Tree::List(vec![Tree::str("failed"), Tree::str(message.clone())])
        }
    };
    Tree::List(vec![
        Tree::str(effect.effect_id.clone()),
        convert(&effect.args, ext),
        pack_effects(&effect.nested, ext),
        outcome,
    ])
}

/// Rebuild side effects from an entry's tree form, resolving externalized
/// references to replay-local replicas.
pub fn unpack_effects(tree: &Tree, resolver: &dyn Resolver) -> Result<Vec<SideEffect>, Error> {
    let Tree::List(items) = tree else {
        return Err(Error::Corrupt("side effects are not a list".to_string()));
    };
    items.iter().map(|item| unpack_one(item, resolver)).collect()
}

fn unpack_one(tree: &Tree, resolver: &dyn Resolver) -> Result<SideEffect, Error> {
    let Tree::List(parts) = tree else {
        return Err(Error::Corrupt("side effect is not a tuple".to_string()));
    };
    let [effect_id, args, nested, outcome] = parts.as_slice() else {
        return Err(Error::Corrupt(format!(
            "side effect tuple has {} parts, expected 4",
            parts.len()
        )));
    };
    let Tree::Str(effect_id) = effect_id else {
        return Err(Error::Corrupt("side effect id is not a string".to_string()));
    };

    let outcome = match outcome {
        Tree::List(tag) => match tag.as_slice() {
            [Tree::Str(kind), value] if kind == "ok" => EffectOutcome::Ok(
                unpack(value, resolver).map_err(|err| Error::Corrupt(err.to_string()))?,
            ),
            [Tree::Str(kind), Tree::Str(message)] if kind == "failed" => {
                EffectOutcome::Failed(message.clone())
            }
            _ => return Err(Error::Corrupt("unknown side effect outcome".to_string())),
        },
        _ => return Err(Error::Corrupt("unknown side effect outcome".to_string())),
    };

    Ok(SideEffect {
        effect_id: effect_id.clone(),
        args: unpack(args, resolver).map_err(|err| Error::Corrupt(err.to_string()))?,
        nested: unpack_effects(nested, resolver)?,
        outcome,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use snapshot::{NoExternalizer, NoResolver};

    #[test]
    fn effects_round_trip_through_tree_form() {
        let effects = vec![
            SideEffect {
                effect_id: "medium.get_time".to_string(),
                args: Live::Null,
                nested: vec![],
                outcome: EffectOutcome::Ok(Live::Float(100.5)),
            },
            SideEffect {
                effect_id: "medium.send_msg".to_string(),
                args: Live::List(vec![Live::Str("w2".to_string())]),
                nested: vec![SideEffect {
                    effect_id: "channel.publish".to_string(),
                    args: Live::Null,
                    nested: vec![],
                    outcome: EffectOutcome::Failed("broker unreachable".to_string()),
                }],
                outcome: EffectOutcome::Failed("broker unreachable".to_string()),
            },
        ];

        let packed = pack_effects(&effects, &NoExternalizer);
        let unpacked = unpack_effects(&packed, &NoResolver).unwrap();

        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0].effect_id, "medium.get_time");
        assert!(matches!(&unpacked[0].outcome, EffectOutcome::Ok(Live::Float(f)) if *f == 100.5));
        assert_eq!(unpacked[1].nested.len(), 1);
        assert!(
            matches!(&unpacked[1].nested[0].outcome, EffectOutcome::Failed(m) if m == "broker unreachable")
        );
    }

    #[test]
    fn malformed_effects_are_rejected() {
        assert!(unpack_effects(&Tree::Int(3), &NoResolver).is_err());
        assert!(unpack_effects(&Tree::List(vec![Tree::List(vec![])]), &NoResolver).is_err());
    }
}
