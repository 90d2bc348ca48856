// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which venue environment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Testnet,
    Mainnet,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Testnet
    }
}

impl Environment {
    pub fn rest_base_url(&self) -> &'static str {
        match self {
            Self::Testnet => "https://api-testnet.bybit.com",
            Self::Mainnet => "https://api.bybit.com",
        }
    }

    pub fn public_ws_url(&self) -> &'static str {
        match self {
            Self::Testnet => "wss://stream-testnet.bybit.com/v5/public/linear",
            Self::Mainnet => "wss://stream.bybit.com/v5/public/linear",
        }
    }

    pub fn private_ws_url(&self) -> &'static str {
        match self {
            Self::Testnet => "wss://stream-testnet.bybit.com/v5/private",
            Self::Mainnet => "wss://stream.bybit.com/v5/private",
        }
    }

    pub fn is_testnet(&self) -> bool {
        matches!(self, Self::Testnet)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Testnet => write!(f, "testnet"),
            Self::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// Which execution backend handles orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Backtest,
    Paper,
    Live,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backtest => write!(f, "backtest"),
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Direction of a trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Close,
}

impl Direction {
    /// Order side that opens a position in this direction.
    pub fn entry_side(&self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short | Self::Close => Side::Sell,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Self::Long)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Order side as the venue spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_entry_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(Self::Long),
            Direction::Short => Some(Self::Short),
            Direction::Close => None,
        }
    }

    /// Order side that closes a position on this side.
    pub fn close_side(&self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }

    pub fn matches_direction(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Long, Direction::Long) | (Self::Short, Direction::Short)
        )
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

/// Order type subset the engine submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
        }
    }
}

/// Time-in-force values the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_entry_side() {
        assert_eq!(Direction::Long.entry_side(), Side::Buy);
        assert_eq!(Direction::Short.entry_side(), Side::Sell);
    }

    #[test]
    fn position_close_side_is_opposite() {
        assert_eq!(PositionSide::Long.close_side(), Side::Sell);
        assert_eq!(PositionSide::Short.close_side(), Side::Buy);
    }

    #[test]
    fn environment_urls() {
        assert!(Environment::Testnet.rest_base_url().contains("testnet"));
        assert!(!Environment::Mainnet.rest_base_url().contains("testnet"));
    }

    #[test]
    fn serde_lowercase_modes() {
        let m: TradeMode = serde_json::from_str("\"paper\"").unwrap();
        assert_eq!(m, TradeMode::Paper);
        let e: Environment = serde_json::from_str("\"mainnet\"").unwrap();
        assert_eq!(e, Environment::Mainnet);
    }
}
