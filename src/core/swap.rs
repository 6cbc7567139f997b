//! Cipher swap strategies
//!
//! The engine tracks which of the two configured ciphers is active and, for
//! every nugget an access touches, decides whether that nugget should move to
//! the active cipher and what the move costs.
//!
//! | strategy    | assignment at creation        | runtime migration |
//! |-------------|-------------------------------|-------------------|
//! | `disabled`  | all primary                   | never             |
//! | `mirrored`  | first half primary, rest swap | never             |
//! | `selective` | byte range swap, rest primary | never             |
//! | `N-forward` | all primary                   | on access         |

use crate::cipher::SwappableCipher;
use crate::error::{Result, SwitchCryptError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

const FORWARD_PATTERN: &str = r"^(?:swap[_-])?(\d+)[_-]forward$";

/// Out-of-band control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapCommand {
    /// Flip the active cipher
    FlipActiveCipher,
}

impl SwapCommand {
    pub const FLIP_OPCODE: u8 = 1;

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            Self::FLIP_OPCODE => Some(SwapCommand::FlipActiveCipher),
            _ => None,
        }
    }

    pub fn opcode(self) -> u8 {
        match self {
            SwapCommand::FlipActiveCipher => Self::FLIP_OPCODE,
        }
    }
}

/// Half-open byte range `[start, end)` over the device body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStrategy {
    Disabled,
    Mirrored,
    Selective(ByteRange),
    /// Migrate on access, then walk the next N nuggets
    Forward(u32),
}

impl SwapStrategy {
    /// Parse a strategy name such as `swap_disabled`, `mirrored` or `swap_2_forward`
    ///
    /// `selective` needs the byte range it assigns to the swap cipher.
    pub fn parse(name: &str, selective: Option<ByteRange>) -> Result<Self> {
        let lowered = name.trim().to_lowercase();

        let forward = Regex::new(FORWARD_PATTERN)
            .map_err(|e| SwitchCryptError::UnknownSwapStrategy(format!("{}: {}", name, e)))?;
        if let Some(caps) = forward.captures(&lowered) {
            let n = caps[1]
                .parse::<u32>()
                .map_err(|_| SwitchCryptError::UnknownSwapStrategy(name.to_string()))?;
            return Ok(SwapStrategy::Forward(n));
        }

        let bare = lowered
            .strip_prefix("swap_")
            .or_else(|| lowered.strip_prefix("swap-"))
            .unwrap_or(&lowered);

        match bare {
            "disabled" => Ok(SwapStrategy::Disabled),
            "mirrored" => Ok(SwapStrategy::Mirrored),
            "selective" => {
                let range = selective.ok_or_else(|| {
                    SwitchCryptError::InvalidSelectiveRange(
                        "selective strategy requires a byte range".to_string(),
                    )
                })?;
                if range.start >= range.end {
                    return Err(SwitchCryptError::InvalidSelectiveRange(format!(
                        "empty range {}..{}",
                        range.start, range.end
                    )));
                }
                Ok(SwapStrategy::Selective(range))
            }
            _ => Err(SwitchCryptError::UnknownSwapStrategy(name.to_string())),
        }
    }

    pub fn name(&self) -> String {
        match self {
            SwapStrategy::Disabled => "swap_disabled".to_string(),
            SwapStrategy::Mirrored => "swap_mirrored".to_string(),
            SwapStrategy::Selective(_) => "swap_selective".to_string(),
            SwapStrategy::Forward(n) => format!("swap_{}_forward", n),
        }
    }

    /// Whether nuggets can change cipher after creation
    pub fn is_dynamic(&self) -> bool {
        matches!(self, SwapStrategy::Forward(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActiveCipher {
    Primary,
    Swap,
}

impl ActiveCipher {
    pub fn flipped(self) -> Self {
        match self {
            ActiveCipher::Primary => ActiveCipher::Swap,
            ActiveCipher::Swap => ActiveCipher::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// What an access must do to a nugget before touching its flakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Nugget already uses the right cipher
    None,
    /// Pristine nugget: relabel, no ciphertext to redo
    LabelFlip,
    /// Non-pristine nugget: bump keycount and re-encrypt
    Rekey,
}

pub struct SwapEngine {
    strategy: SwapStrategy,
    primary: SwappableCipher,
    swap: SwappableCipher,
    active: ActiveCipher,
}

impl SwapEngine {
    pub fn new(strategy: SwapStrategy, primary: SwappableCipher, swap: SwappableCipher) -> Self {
        SwapEngine {
            strategy,
            primary,
            swap,
            active: ActiveCipher::Primary,
        }
    }

    pub fn strategy(&self) -> &SwapStrategy {
        &self.strategy
    }

    pub fn primary(&self) -> SwappableCipher {
        self.primary
    }

    pub fn swap(&self) -> SwappableCipher {
        self.swap
    }

    pub fn active(&self) -> ActiveCipher {
        self.active
    }

    pub fn active_cipher(&self) -> SwappableCipher {
        match self.active {
            ActiveCipher::Primary => self.primary,
            ActiveCipher::Swap => self.swap,
        }
    }

    /// Apply a command; returns true if the active cipher changed
    ///
    /// Strategies with fixed assignments other than `mirrored` keep the
    /// primary cipher active and ignore commands.
    pub fn apply(&mut self, command: SwapCommand) -> bool {
        match (command, self.strategy) {
            (SwapCommand::FlipActiveCipher, SwapStrategy::Mirrored)
            | (SwapCommand::FlipActiveCipher, SwapStrategy::Forward(_)) => {
                self.active = self.active.flipped();
                true
            }
            (SwapCommand::FlipActiveCipher, _) => false,
        }
    }

    /// Cipher a nugget is assigned when the device is created
    pub fn initial_cipher(&self, nugget: u64, num_nuggets: u64, nugget_size: u64) -> SwappableCipher {
        match self.strategy {
            SwapStrategy::Disabled | SwapStrategy::Forward(_) => self.primary,
            SwapStrategy::Mirrored => {
                if nugget < num_nuggets / 2 {
                    self.primary
                } else {
                    self.swap
                }
            }
            SwapStrategy::Selective(range) => {
                let start = nugget * nugget_size;
                if range.overlaps(start, start + nugget_size) {
                    self.swap
                } else {
                    self.primary
                }
            }
        }
    }

    /// Decide what must happen to a nugget currently under `current`
    pub fn decide(&self, current: SwappableCipher, pristine: bool) -> Migration {
        if !self.strategy.is_dynamic() || current == self.active_cipher() {
            Migration::None
        } else if pristine {
            Migration::LabelFlip
        } else {
            Migration::Rekey
        }
    }

    /// Extra nuggets to walk after migrating `nugget`
    ///
    /// Any access whose target had to move walks the next N nuggets; the range
    /// never extends past the last nugget.
    pub fn forward_window(&self, nugget: u64, num_nuggets: u64, migration: Migration) -> Range<u64> {
        let start = nugget.saturating_add(1).min(num_nuggets);
        match (self.strategy, migration) {
            (SwapStrategy::Forward(_), Migration::None) => start..start,
            (SwapStrategy::Forward(n), _) => {
                let end = start.saturating_add(n as u64).min(num_nuggets);
                start..end
            }
            _ => start..start,
        }
    }

    /// Decide for a nugget inside the forward window
    ///
    /// Writes relabel pristine nuggets ahead but leave written ones alone.
    pub fn decide_ahead(&self, current: SwappableCipher, pristine: bool, access: Access) -> Migration {
        match (self.decide(current, pristine), access) {
            (Migration::Rekey, Access::Write) => Migration::None,
            (migration, _) => migration,
        }
    }

    /// Nuggets visible through the device interface
    pub fn logical_nuggets(&self, num_nuggets: u64) -> u64 {
        match self.strategy {
            SwapStrategy::Mirrored => num_nuggets / 2,
            _ => num_nuggets,
        }
    }

    /// Physical nugget to read for a logical one under `mirrored`
    pub fn mirror_read_source(&self, nugget: u64, num_nuggets: u64) -> u64 {
        match (self.strategy, self.active) {
            (SwapStrategy::Mirrored, ActiveCipher::Swap) => nugget + num_nuggets / 2,
            _ => nugget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: SwappableCipher = SwappableCipher::ChaCha20;
    const S: SwappableCipher = SwappableCipher::ChaCha8;

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!(SwapStrategy::parse("swap_disabled", None).unwrap(), SwapStrategy::Disabled);
        assert_eq!(SwapStrategy::parse("disabled", None).unwrap(), SwapStrategy::Disabled);
        assert_eq!(SwapStrategy::parse("swap_mirrored", None).unwrap(), SwapStrategy::Mirrored);
        assert_eq!(SwapStrategy::parse("swap_0_forward", None).unwrap(), SwapStrategy::Forward(0));
        assert_eq!(SwapStrategy::parse("2-forward", None).unwrap(), SwapStrategy::Forward(2));
        assert_eq!(SwapStrategy::parse("SWAP_10_FORWARD", None).unwrap(), SwapStrategy::Forward(10));

        let range = ByteRange { start: 0, end: 16 };
        assert_eq!(
            SwapStrategy::parse("swap_selective", Some(range)).unwrap(),
            SwapStrategy::Selective(range)
        );

        let forward = SwapStrategy::Forward(3);
        assert_eq!(SwapStrategy::parse(&forward.name(), None).unwrap(), forward);
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for name in ["swap_sideways", "forward", "swap__forward", "99999999999_forward"] {
            assert!(matches!(
                SwapStrategy::parse(name, None),
                Err(SwitchCryptError::UnknownSwapStrategy(_))
            ));
        }

        assert!(matches!(
            SwapStrategy::parse("selective", None),
            Err(SwitchCryptError::InvalidSelectiveRange(_))
        ));
        assert!(matches!(
            SwapStrategy::parse("selective", Some(ByteRange { start: 8, end: 8 })),
            Err(SwitchCryptError::InvalidSelectiveRange(_))
        ));
    }

    #[test]
    fn test_swap_command_opcode() {
        assert_eq!(SwapCommand::from_opcode(1), Some(SwapCommand::FlipActiveCipher));
        assert_eq!(SwapCommand::from_opcode(0), None);
        assert_eq!(SwapCommand::FlipActiveCipher.opcode(), 1);
    }

    #[test]
    fn test_disabled_ignores_commands() {
        let mut engine = SwapEngine::new(SwapStrategy::Disabled, P, S);
        assert!(!engine.apply(SwapCommand::FlipActiveCipher));
        assert_eq!(engine.active_cipher(), P);
        assert_eq!(engine.decide(S, false), Migration::None);
        assert_eq!(engine.initial_cipher(7, 8, 16), P);
    }

    #[test]
    fn test_forward_decisions() {
        let mut engine = SwapEngine::new(SwapStrategy::Forward(0), P, S);
        assert_eq!(engine.decide(P, false), Migration::None);

        assert!(engine.apply(SwapCommand::FlipActiveCipher));
        assert_eq!(engine.active_cipher(), S);
        assert_eq!(engine.decide(P, true), Migration::LabelFlip);
        assert_eq!(engine.decide(P, false), Migration::Rekey);
        assert_eq!(engine.decide(S, false), Migration::None);
    }

    #[test]
    fn test_forward_window_stays_in_bounds() {
        let engine = SwapEngine::new(SwapStrategy::Forward(2), P, S);

        assert_eq!(engine.forward_window(0, 5, Migration::Rekey), 1..3);
        assert_eq!(engine.forward_window(0, 5, Migration::LabelFlip), 1..3);
        assert_eq!(engine.forward_window(3, 5, Migration::Rekey), 4..5);
        assert_eq!(engine.forward_window(4, 5, Migration::LabelFlip), 5..5);
        assert!(engine.forward_window(0, 5, Migration::None).is_empty());

        let zero = SwapEngine::new(SwapStrategy::Forward(0), P, S);
        assert!(zero.forward_window(0, 5, Migration::Rekey).is_empty());

        let disabled = SwapEngine::new(SwapStrategy::Disabled, P, S);
        assert!(disabled.forward_window(0, 5, Migration::Rekey).is_empty());
    }

    #[test]
    fn test_writes_only_relabel_ahead() {
        let mut engine = SwapEngine::new(SwapStrategy::Forward(2), P, S);
        engine.apply(SwapCommand::FlipActiveCipher);

        assert_eq!(engine.decide_ahead(P, true, Access::Write), Migration::LabelFlip);
        assert_eq!(engine.decide_ahead(P, false, Access::Write), Migration::None);
        assert_eq!(engine.decide_ahead(P, true, Access::Read), Migration::LabelFlip);
        assert_eq!(engine.decide_ahead(P, false, Access::Read), Migration::Rekey);
        assert_eq!(engine.decide_ahead(S, false, Access::Read), Migration::None);
    }

    #[test]
    fn test_mirrored_assignment() {
        let mut engine = SwapEngine::new(SwapStrategy::Mirrored, P, S);
        assert_eq!(engine.initial_cipher(0, 5, 16), P);
        assert_eq!(engine.initial_cipher(1, 5, 16), P);
        assert_eq!(engine.initial_cipher(2, 5, 16), S);
        assert_eq!(engine.initial_cipher(4, 5, 16), S);
        assert_eq!(engine.logical_nuggets(5), 2);

        assert_eq!(engine.mirror_read_source(1, 4), 1);
        engine.apply(SwapCommand::FlipActiveCipher);
        assert_eq!(engine.mirror_read_source(1, 4), 3);
        assert_eq!(engine.decide(P, false), Migration::None);
    }

    #[test]
    fn test_selective_assignment() {
        let range = ByteRange { start: 20, end: 33 };
        let engine = SwapEngine::new(SwapStrategy::Selective(range), P, S);

        assert_eq!(engine.initial_cipher(0, 4, 16), P);
        assert_eq!(engine.initial_cipher(1, 4, 16), S);
        assert_eq!(engine.initial_cipher(2, 4, 16), S);
        assert_eq!(engine.initial_cipher(3, 4, 16), P);
    }
}
