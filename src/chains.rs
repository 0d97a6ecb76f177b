//! # Supported Chains
//!
//! Closed set of EVM chains the engine can fan out over, with the per-chain constants
//! the core needs: chain id, empirically measured average blocks per day (used to turn
//! block ranges into durations) and the reorg safety margin applied to the chain head.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Ethereum,
    Optimism,
    Bsc,
    Polygon,
    Fantom,
    Base,
    Arbitrum,
    Avalanche,
    Linea,
}

impl Chain {
    pub const ALL: [Chain; 9] = [
        Chain::Ethereum,
        Chain::Optimism,
        Chain::Bsc,
        Chain::Polygon,
        Chain::Fantom,
        Chain::Base,
        Chain::Arbitrum,
        Chain::Avalanche,
        Chain::Linea,
    ];

    pub fn chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Optimism => 10,
            Chain::Bsc => 56,
            Chain::Polygon => 137,
            Chain::Fantom => 250,
            Chain::Base => 8453,
            Chain::Arbitrum => 42161,
            Chain::Avalanche => 43114,
            Chain::Linea => 59144,
        }
    }

    pub fn from_chain_id(chain_id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|chain| chain.chain_id() == chain_id)
    }

    /// Average blocks produced per day, measured over a recent 30-day window.
    pub fn average_blocks_per_day(&self) -> u64 {
        match self {
            Chain::Ethereum => 7_146,
            Chain::Optimism => 43_200,
            Chain::Bsc => 28_800,
            Chain::Polygon => 38_500,
            Chain::Fantom => 86_400,
            Chain::Base => 43_200,
            Chain::Arbitrum => 330_000,
            Chain::Avalanche => 43_000,
            Chain::Linea => 28_800,
        }
    }

    /// Blocks kept between the chain head and the "stable" block we read at.
    pub fn stable_block_margin(&self) -> u64 {
        match self {
            Chain::Ethereum => 2,
            Chain::Optimism | Chain::Base => 10,
            Chain::Bsc => 5,
            Chain::Polygon => 32,
            Chain::Fantom => 5,
            Chain::Arbitrum => 40,
            Chain::Avalanche => 5,
            Chain::Linea => 10,
        }
    }

    /// Lower-case identifier used in config keys and env variables (`DEFI_RPC_ETHEREUM`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Optimism => "optimism",
            Chain::Bsc => "bsc",
            Chain::Polygon => "polygon",
            Chain::Fantom => "fantom",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Avalanche => "avalanche",
            Chain::Linea => "linea",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        if let Ok(chain_id) = needle.parse::<u64>() {
            return Self::from_chain_id(chain_id).ok_or_else(|| format!("unknown chain id {}", s));
        }
        Self::ALL
            .into_iter()
            .find(|chain| chain.as_str() == needle)
            .ok_or_else(|| format!("unknown chain {}", s))
    }
}
