use crate::{lock, EffectOutcome, Error, FiberId, SideEffect};
use snapshot::Live;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

/// An open journal section around one call into agent code.
///
/// In record mode the section captures named side effects as they run; in
/// replay mode it holds the entry's stored effects and hands their results
/// back in order, without executing anything.
pub struct Section {
    fiber_id: FiberId,
    fiber_depth: u32,
    entry_id: String,
    state: Mutex<State>,
}

enum State {
    Record {
        effects: Vec<SideEffect>,
        open: Vec<Pending>,
    },
    Replay {
        queue: VecDeque<SideEffect>,
    },
}

struct Pending {
    effect_id: String,
    args: Live,
    nested: Vec<SideEffect>,
}

impl Section {
    /// Open a recording section on a fresh fiber.
    pub fn record(entry_id: impl Into<String>) -> Self {
        Self {
            fiber_id: FiberId::generate(),
            fiber_depth: 0,
            entry_id: entry_id.into(),
            state: Mutex::new(State::Record {
                effects: Vec::new(),
                open: Vec::new(),
            }),
        }
    }

    /// Open a recording section continuing the parent's fiber one level
    /// deeper.
    pub fn record_nested(entry_id: impl Into<String>, parent: &Section) -> Self {
        Self {
            fiber_id: parent.fiber_id,
            fiber_depth: parent.fiber_depth + 1,
            ..Self::record(entry_id)
        }
    }

    /// Open a replay section seeded with an entry's recorded effects.
    pub fn replay(
        entry_id: impl Into<String>,
        fiber_id: FiberId,
        fiber_depth: u32,
        effects: Vec<SideEffect>,
    ) -> Self {
        Self {
            fiber_id,
            fiber_depth,
            entry_id: entry_id.into(),
            state: Mutex::new(State::Replay {
                queue: effects.into(),
            }),
        }
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber_id
    }
    pub fn fiber_depth(&self) -> u32 {
        self.fiber_depth
    }
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn is_replay(&self) -> bool {
        matches!(&*lock(&self.state), State::Replay { .. })
    }

    /// Run `f` as the named side effect `effect_id`.
    ///
    /// Record mode: executes `f`, captures `(effect_id, args, nested,
    /// outcome)`, and passes the result through. Replay mode: `f` is never
    /// called; the next stored effect's result is returned instead, and a
    /// mismatched effect id is a replay error.
    pub async fn recorded<F, Fut>(&self, effect_id: &str, args: Live, f: F) -> Result<Live, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Live, anyhow::Error>>,
    {
        {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Replay { queue } => {
                    let Some(stored) = queue.pop_front() else {
                        return Err(Error::EffectMismatch {
                            expected: effect_id.to_string(),
                            found: None,
                        });
                    };
                    if stored.effect_id != effect_id {
                        return Err(Error::EffectMismatch {
                            expected: effect_id.to_string(),
                            found: Some(stored.effect_id),
                        });
                    }
                    return match stored.outcome {
                        EffectOutcome::Ok(value) => Ok(value),
                        EffectOutcome::Failed(message) => Err(Error::Recorded(message)),
                    };
                }
                State::Record { open, .. } => {
                    open.push(Pending {
                        effect_id: effect_id.to_string(),
                        args,
                        nested: Vec::new(),
                    });
                }
            }
        }

        let result = f().await;

        let mut state = lock(&self.state);
        let State::Record { effects, open } = &mut *state else {
            unreachable!("section mode cannot change while an effect is open");
        };
        let pending = open.pop().expect("an effect is open");
        let outcome = match &result {
            Ok(value) => EffectOutcome::Ok(value.clone()),
            Err(err) => EffectOutcome::Failed(format!("{err:#}")),
        };
        let effect = SideEffect {
            effect_id: pending.effect_id,
            args: pending.args,
            nested: pending.nested,
            outcome,
        };
        match open.last_mut() {
            Some(parent) => parent.nested.push(effect),
            None => effects.push(effect),
        }

        result.map_err(Error::Effect)
    }

    /// Close the section and take its captured effects (record mode).
    pub fn finish(&self) -> Vec<SideEffect> {
        match &mut *lock(&self.state) {
            State::Record { effects, .. } => std::mem::take(effects),
            State::Replay { .. } => Vec::new(),
        }
    }
}
