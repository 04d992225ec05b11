// =============================================================================
// Shared types used across the Relay copy engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an incoming signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Close,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Close => write!(f, "close"),
        }
    }
}

impl Action {
    /// Parse a payload action string. Unknown actions are rejected at the
    /// edge, so this returns `None` rather than defaulting.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Used in every P&L formula.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// The broker order action that opens (or adds to) this side.
    pub fn entry_action(&self) -> Action {
        match self {
            Self::Long => Action::Buy,
            Self::Short => Action::Sell,
        }
    }

    /// The broker order action that closes this side.
    pub fn exit_action(&self) -> Action {
        match self {
            Self::Long => Action::Sell,
            Self::Short => Action::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Whether the engine is accepting signals, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Which Tradovate environment an account trades against. The symbol cache
/// and base URL are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Demo,
    Live,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "demo"),
            Self::Live => write!(f, "live"),
        }
    }
}

// ---------------------------------------------------------------------------
// TP / SL specifications
// ---------------------------------------------------------------------------

/// Unit a take-profit or stop-loss distance is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetUnit {
    Ticks,
    Points,
    Percent,
}

impl Default for OffsetUnit {
    fn default() -> Self {
        Self::Ticks
    }
}

impl std::fmt::Display for OffsetUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticks => write!(f, "ticks"),
            Self::Points => write!(f, "points"),
            Self::Percent => write!(f, "percent"),
        }
    }
}

/// Stop-loss behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlType {
    Fixed,
    Trailing,
    BreakEven,
}

impl Default for SlType {
    fn default() -> Self {
        Self::Fixed
    }
}

impl std::fmt::Display for SlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Trailing => write!(f, "trailing"),
            Self::BreakEven => write!(f, "break-even"),
        }
    }
}

/// A take-profit distance from entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpSpec {
    pub value: Decimal,
    #[serde(default)]
    pub unit: OffsetUnit,
}

/// A stop-loss distance from entry plus its behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlSpec {
    pub value: Decimal,
    #[serde(default)]
    pub unit: OffsetUnit,
    #[serde(default)]
    pub sl_type: SlType,
}

/// One target of a laddered take-profit: distance plus the percentage of
/// the position quantity to trim when it fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpTarget {
    pub value: Decimal,
    #[serde(default)]
    pub unit: OffsetUnit,
    /// Percentage of the current quantity to trim (1..=100).
    pub trim_pct: u32,
}

/// Effective bracket for a dispatched order: optional TP, optional SL, and
/// an ordered ladder of trim targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BracketSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp: Option<TpSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sl: Option<SlSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TpTarget>,
}

impl BracketSpec {
    pub fn is_empty(&self) -> bool {
        self.tp.is_none() && self.sl.is_none() && self.targets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_parse_is_case_insensitive() {
        assert_eq!(Action::parse("BUY"), Some(Action::Buy));
        assert_eq!(Action::parse("Sell"), Some(Action::Sell));
        assert_eq!(Action::parse("close"), Some(Action::Close));
        assert_eq!(Action::parse("hold"), None);
    }

    #[test]
    fn side_signs_and_exits() {
        assert_eq!(Side::Long.sign(), Decimal::ONE);
        assert_eq!(Side::Short.sign(), -Decimal::ONE);
        assert_eq!(Side::Long.exit_action(), Action::Sell);
        assert_eq!(Side::Short.exit_action(), Action::Buy);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn sl_type_serde_kebab_case() {
        let json = serde_json::to_string(&SlType::BreakEven).unwrap();
        assert_eq!(json, "\"break-even\"");
        let back: SlType = serde_json::from_str("\"trailing\"").unwrap();
        assert_eq!(back, SlType::Trailing);
    }

    #[test]
    fn bracket_spec_default_is_empty() {
        assert!(BracketSpec::default().is_empty());
    }
}
