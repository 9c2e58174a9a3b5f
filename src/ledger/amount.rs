//! Fixed-point token amounts

use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units};
use std::fmt;

/// Assets moved by the workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    /// Stable-coin leg
    Usdc,
    /// Base-asset (collateral) leg
    Eth,
}

impl Asset {
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Usdc => 6,
            Asset::Eth => 18,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Usdc => "USDC",
            Asset::Eth => "ETH",
        }
    }
}

/// A strictly positive amount in the asset's smallest unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAmount {
    asset: Asset,
    raw: U256,
}

impl TokenAmount {
    /// Parse a decimal string such as `"12.5"` at the asset's precision
    pub fn parse(asset: Asset, text: &str) -> CoordinatorResult<Self> {
        let text = text.trim();
        let invalid = |why: String| {
            CoordinatorError::InvalidAmount(format!("{:?} {}: {}", text, asset.symbol(), why))
        };

        if text.is_empty() {
            return Err(invalid("empty".to_string()));
        }
        if text.starts_with('-') {
            return Err(invalid("must be positive".to_string()));
        }
        if let Some((_, fraction)) = text.split_once('.') {
            if fraction.len() > asset.decimals() as usize {
                return Err(invalid(format!(
                    "more than {} decimal places",
                    asset.decimals()
                )));
            }
        }

        let raw: U256 = parse_units(text, asset.decimals())
            .map_err(|e| invalid(e.to_string()))?
            .into();

        if raw.is_zero() {
            return Err(invalid("must be positive".to_string()));
        }

        Ok(Self { asset, raw })
    }

    pub fn from_raw(asset: Asset, raw: U256) -> Self {
        Self { asset, raw }
    }

    pub fn raw(&self) -> U256 {
        self.raw
    }

    /// Decimal string at the asset's precision, without the symbol
    pub fn units(&self) -> String {
        format_units(self.raw, self.asset.decimals()).unwrap_or_else(|_| self.raw.to_string())
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.units(), self.asset.symbol())
    }
}
