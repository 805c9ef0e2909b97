//! The rule-object boundary.
//!
//! Game rules are supplied by the embedding application, either as an
//! implementation of [`GameLogic`] or as a set of plain closures wrapped by
//! [`CallbackGameLogic`]. The controller never interprets game states or
//! undo data; it only moves them between the rules and storage.
//!
//! Rule methods return `anyhow::Result` so user code can fail with whatever
//! error type it likes; the controller translates a failure into a rolled
//! back transaction.

use xayagame_store::{
    BlockHash,
    GameStateData,
    UndoData,
};

use crate::{
    chain::ChainId,
    events::BlockData,
};

/// The genesis declaration of a game: the first block the game reacts to and
/// the state it starts from.
#[derive(Debug, Clone)]
pub struct InitialState {
    pub height: u64,
    /// The expected block hash at `height`. `None` lets the controller trust
    /// whatever hash the node reports for that height.
    pub hash: Option<BlockHash>,
    pub state: GameStateData,
}

/// A game's rules.
pub trait GameLogic: Send + Sync {
    /// Called once when the chain the node serves has been discovered.
    fn set_chain(&mut self, _chain: ChainId) {}

    /// The game's genesis height, hash and starting state.
    fn initial_state(&mut self) -> anyhow::Result<InitialState>;

    /// Apply one block on top of `old_state`, returning the new state and
    /// the undo data sufficient to reverse the step.
    fn process_forward(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
    ) -> anyhow::Result<(GameStateData, UndoData)>;

    /// Reverse the step that attached `block`, using the undo data recorded
    /// at that time.
    fn process_backwards(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
        undo: &UndoData,
    ) -> anyhow::Result<GameStateData>;

    /// Render a game state for the RPC surface. Takes `&self` so read
    /// requests can run under the controller's read lock; implementations
    /// that need mutation (e.g. lazy database initialisation) use interior
    /// mutability.
    fn game_state_to_json(&self, state: &GameStateData) -> anyhow::Result<serde_json::Value> {
        // Default: interpret the state bytes as JSON, falling back to a
        // plain string for games with non-JSON states.
        match serde_json::from_slice(state) {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::Value::String(
                String::from_utf8_lossy(state).into_owned(),
            )),
        }
    }
}

/// Plain-function rule callbacks for embedders that do not want to define a
/// trait implementation.
pub struct GameLogicCallbacks {
    pub initial_state: Box<dyn FnMut(ChainId) -> anyhow::Result<InitialState> + Send + Sync>,
    #[allow(clippy::type_complexity)]
    pub process_forward: Box<
        dyn FnMut(ChainId, &GameStateData, &BlockData) -> anyhow::Result<(GameStateData, UndoData)>
            + Send
            + Sync,
    >,
    #[allow(clippy::type_complexity)]
    pub process_backwards: Box<
        dyn FnMut(ChainId, &GameStateData, &BlockData, &UndoData) -> anyhow::Result<GameStateData>
            + Send
            + Sync,
    >,
}

/// Adapter presenting [`GameLogicCallbacks`] as a [`GameLogic`].
pub struct CallbackGameLogic {
    callbacks: GameLogicCallbacks,
    chain: ChainId,
}

impl CallbackGameLogic {
    pub fn new(callbacks: GameLogicCallbacks) -> Self {
        Self {
            callbacks,
            chain: ChainId::Main,
        }
    }
}

impl GameLogic for CallbackGameLogic {
    fn set_chain(&mut self, chain: ChainId) {
        self.chain = chain;
    }

    fn initial_state(&mut self) -> anyhow::Result<InitialState> {
        (self.callbacks.initial_state)(self.chain)
    }

    fn process_forward(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
    ) -> anyhow::Result<(GameStateData, UndoData)> {
        (self.callbacks.process_forward)(self.chain, old_state, block)
    }

    fn process_backwards(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
        undo: &UndoData,
    ) -> anyhow::Result<GameStateData> {
        (self.callbacks.process_backwards)(self.chain, old_state, block, undo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_logic_forwards_chain() {
        let callbacks = GameLogicCallbacks {
            initial_state: Box::new(|chain| {
                Ok(InitialState {
                    height: 0,
                    hash: None,
                    state: chain.to_string().into_bytes(),
                })
            }),
            process_forward: Box::new(|_, old, _| Ok((old.clone(), Vec::new()))),
            process_backwards: Box::new(|_, old, _, _| Ok(old.clone())),
        };

        let mut logic = CallbackGameLogic::new(callbacks);
        logic.set_chain(ChainId::Regtest);
        let init = logic.initial_state().unwrap();
        assert_eq!(init.state, b"regtest".to_vec());
    }

    #[test]
    fn default_json_rendering() {
        struct Dummy;
        impl GameLogic for Dummy {
            fn initial_state(&mut self) -> anyhow::Result<InitialState> {
                unreachable!()
            }
            fn process_forward(
                &mut self,
                _: &GameStateData,
                _: &BlockData,
            ) -> anyhow::Result<(GameStateData, UndoData)> {
                unreachable!()
            }
            fn process_backwards(
                &mut self,
                _: &GameStateData,
                _: &BlockData,
                _: &UndoData,
            ) -> anyhow::Result<GameStateData> {
                unreachable!()
            }
        }

        let logic = Dummy;
        let json = logic.game_state_to_json(&b"{\"a\": 1}".to_vec()).unwrap();
        assert_eq!(json["a"], 1);

        let text = logic.game_state_to_json(&b"plain".to_vec()).unwrap();
        assert_eq!(text, serde_json::Value::String("plain".to_string()));
    }
}
