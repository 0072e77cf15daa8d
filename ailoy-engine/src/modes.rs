//! Stream modes: labeled decoding states with open/close indicator token
//! sequences and optional grammar constraints.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::backend::Grammar;
use crate::error::EngineError;

/// The always-present default mode.
pub const OUTPUT_TEXT: &str = "output_text";
/// The reasoning mode delimited by `<think>` tokens.
pub const REASONING: &str = "reasoning";
/// The tool-call mode delimited by the model's tool-call tokens.
pub const TOOL_CALL: &str = "tool_call";

/// One registered stream mode.
#[derive(Clone)]
pub struct StreamMode {
    /// Token sequence whose appearance switches into this mode.
    pub open_indicator: Vec<u32>,
    /// Token sequence whose appearance switches back to the default.
    pub close_indicator: Vec<u32>,
    /// Grammar constraining sampling while inside this mode.
    pub grammar: Option<Arc<dyn Grammar>>,
}

/// The registry of stream modes plus the current mode.
///
/// Modes are kept in registration order; when open indicators overlap, the
/// first registered match wins. The default `output_text` mode has empty
/// indicators and is always first.
pub struct ModeRegistry {
    modes: IndexMap<String, StreamMode>,
    current: String,
}

impl ModeRegistry {
    /// A registry holding only `output_text`.
    pub fn new() -> Self {
        let mut modes = IndexMap::new();
        modes.insert(
            OUTPUT_TEXT.to_owned(),
            StreamMode {
                open_indicator: Vec::new(),
                close_indicator: Vec::new(),
                grammar: None,
            },
        );
        Self {
            modes,
            current: OUTPUT_TEXT.to_owned(),
        }
    }

    /// Register a mode.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the name is taken or an indicator is empty.
    pub fn register(&mut self, name: &str, mode: StreamMode) -> Result<(), EngineError> {
        if self.modes.contains_key(name) {
            return Err(EngineError::InvalidInput(format!(
                "stream mode {name} already registered"
            )));
        }
        if mode.open_indicator.is_empty() || mode.close_indicator.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "stream mode {name} needs non-empty indicators"
            )));
        }
        self.modes.insert(name.to_owned(), mode);
        Ok(())
    }

    /// The mode the decoder is currently in.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// True when the decoder is in `output_text`.
    pub fn in_default(&self) -> bool {
        self.current == OUTPUT_TEXT
    }

    /// Look up a mode.
    pub fn get(&self, name: &str) -> Option<&StreamMode> {
        self.modes.get(name)
    }

    /// Bind a grammar to a mode (replacing any existing binding).
    pub fn set_grammar(&mut self, name: &str, grammar: Arc<dyn Grammar>) -> Result<(), EngineError> {
        let mode = self
            .modes
            .get_mut(name)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown stream mode {name}")))?;
        mode.grammar = Some(grammar);
        Ok(())
    }

    /// Remove a mode's grammar binding.
    pub fn reset_grammar(&mut self, name: &str) -> Result<(), EngineError> {
        let mode = self
            .modes
            .get_mut(name)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown stream mode {name}")))?;
        mode.grammar = None;
        Ok(())
    }

    /// Force the current mode back to `output_text`.
    pub fn reset_current(&mut self) {
        self.current = OUTPUT_TEXT.to_owned();
    }

    /// Evaluate a transition after `history` grew by one token.
    ///
    /// In the default mode, entering any non-default mode whose open
    /// indicator is the closing suffix of `history`; in a non-default
    /// mode, exiting when its close indicator is the closing suffix.
    pub fn transition(&mut self, history: &[u32]) -> Option<Transition> {
        if self.in_default() {
            for (name, mode) in self.modes.iter().skip(1) {
                if ends_with(history, &mode.open_indicator) {
                    self.current = name.clone();
                    return Some(Transition::Entered {
                        mode: name.clone(),
                        indicator_len: mode.open_indicator.len(),
                        grammar: mode.grammar.clone(),
                        close_indicator: mode.close_indicator.clone(),
                    });
                }
            }
            None
        } else {
            let mode = &self.modes[&self.current];
            if ends_with(history, &mode.close_indicator) {
                let name = std::mem::replace(&mut self.current, OUTPUT_TEXT.to_owned());
                let indicator_len = self.modes[&name].close_indicator.len();
                return Some(Transition::Exited {
                    mode: name,
                    indicator_len,
                });
            }
            None
        }
    }

    /// Length of the longest proper prefix of a relevant indicator that
    /// matches the tail of `history`. Used to withhold tokens that may
    /// turn out to be a mode boundary.
    pub fn withhold_len(&self, history: &[u32]) -> usize {
        let mut longest = 0;
        if self.in_default() {
            for (_, mode) in self.modes.iter().skip(1) {
                longest = longest.max(prefix_overlap(history, &mode.open_indicator));
            }
        } else {
            let mode = &self.modes[&self.current];
            longest = prefix_overlap(history, &mode.close_indicator);
        }
        longest
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A mode switch produced by [`ModeRegistry::transition`].
pub enum Transition {
    /// Switched from `output_text` into a non-default mode.
    Entered {
        /// The mode entered.
        mode: String,
        /// Length of the open indicator, for retracting withheld tokens.
        indicator_len: usize,
        /// Grammar to instantiate a matcher from, if bound.
        grammar: Option<Arc<dyn Grammar>>,
        /// The mode's close indicator, used as matcher stop tokens.
        close_indicator: Vec<u32>,
    },
    /// Switched back to `output_text`.
    Exited {
        /// The mode left.
        mode: String,
        /// Length of the close indicator.
        indicator_len: usize,
    },
}

fn ends_with(history: &[u32], indicator: &[u32]) -> bool {
    !indicator.is_empty() && history.len() >= indicator.len()
        && &history[history.len() - indicator.len()..] == indicator
}

/// Longest `k < indicator.len()` such that the last `k` tokens of
/// `history` equal the first `k` tokens of `indicator`.
fn prefix_overlap(history: &[u32], indicator: &[u32]) -> usize {
    if indicator.is_empty() {
        return 0;
    }
    let max = indicator.len().saturating_sub(1).min(history.len());
    for k in (1..=max).rev() {
        if history[history.len() - k..] == indicator[..k] {
            return k;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModeRegistry {
        let mut modes = ModeRegistry::new();
        modes
            .register(
                REASONING,
                StreamMode {
                    open_indicator: vec![10],
                    close_indicator: vec![11],
                    grammar: None,
                },
            )
            .unwrap();
        modes
            .register(
                TOOL_CALL,
                StreamMode {
                    open_indicator: vec![20, 21],
                    close_indicator: vec![22, 23],
                    grammar: None,
                },
            )
            .unwrap();
        modes
    }

    #[test]
    fn enters_on_open_indicator_suffix() {
        let mut modes = registry();
        assert!(modes.transition(&[1, 2, 3]).is_none());
        match modes.transition(&[1, 2, 10]) {
            Some(Transition::Entered { mode, indicator_len, .. }) => {
                assert_eq!(mode, REASONING);
                assert_eq!(indicator_len, 1);
            }
            _ => panic!("expected to enter reasoning"),
        }
        assert_eq!(modes.current(), REASONING);
    }

    #[test]
    fn exits_on_close_indicator_suffix() {
        let mut modes = registry();
        modes.transition(&[10]);
        assert!(modes.transition(&[10, 5]).is_none());
        match modes.transition(&[10, 5, 11]) {
            Some(Transition::Exited { mode, .. }) => assert_eq!(mode, REASONING),
            _ => panic!("expected to exit reasoning"),
        }
        assert!(modes.in_default());
    }

    #[test]
    fn multi_token_indicator_matches_whole_suffix() {
        let mut modes = registry();
        assert!(modes.transition(&[20]).is_none());
        assert!(matches!(
            modes.transition(&[20, 21]),
            Some(Transition::Entered { .. })
        ));
        assert_eq!(modes.current(), TOOL_CALL);
    }

    #[test]
    fn registration_order_breaks_ties() {
        let mut modes = ModeRegistry::new();
        modes
            .register(
                "first",
                StreamMode {
                    open_indicator: vec![7],
                    close_indicator: vec![8],
                    grammar: None,
                },
            )
            .unwrap();
        modes
            .register(
                "second",
                StreamMode {
                    open_indicator: vec![7],
                    close_indicator: vec![9],
                    grammar: None,
                },
            )
            .unwrap();
        match modes.transition(&[7]) {
            Some(Transition::Entered { mode, .. }) => assert_eq!(mode, "first"),
            _ => panic!("expected a transition"),
        }
    }

    #[test]
    fn withhold_covers_partial_indicators() {
        let modes = registry();
        // [20] is a proper prefix of tool_call's [20, 21] opener.
        assert_eq!(modes.withhold_len(&[1, 2, 20]), 1);
        assert_eq!(modes.withhold_len(&[1, 2, 3]), 0);
    }

    #[test]
    fn duplicate_mode_rejected() {
        let mut modes = registry();
        let err = modes
            .register(
                REASONING,
                StreamMode {
                    open_indicator: vec![1],
                    close_indicator: vec![2],
                    grammar: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
