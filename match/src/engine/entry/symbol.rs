//! Symbol Types and Structures
//!
//! This module defines the trading pair identifier ("BASE/QUOTE") and the
//! validation applied to symbols, prices and quantities before they reach the
//! ledger.

use crate::engine::entry::money;
use crate::error::ExchangeError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted symbol, separator included.
pub const MAX_SYMBOL_LEN: usize = 10;

/// A validated trading pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    /// Full pair name (e.g., "BTC/USDT")
    pub name: String,
    /// Base currency of the trading pair (e.g., "BTC")
    pub base: String,
    /// Quote currency of the trading pair (e.g., "USDT")
    pub quote: String,
}

impl Symbol {
    /// Parses and validates a "BASE/QUOTE" pair name
    ///
    /// # Arguments
    /// * `name` - Pair name as submitted by the caller
    ///
    /// # Returns
    /// The parsed symbol, or `InvalidInput` when the name is malformed
    pub fn parse(name: &str) -> Result<Symbol, ExchangeError> {
        let invalid = || ExchangeError::InvalidInput(format!("malformed symbol {:?}", name));
        if name.is_empty() || name.len() > MAX_SYMBOL_LEN {
            return Err(invalid());
        }
        let (base, quote) = name.split_once('/').ok_or_else(invalid)?;
        let well_formed =
            |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if !well_formed(base) || !well_formed(quote) {
            return Err(invalid());
        }
        Ok(Symbol {
            name: name.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }

    /// Validates a limit price: strictly positive, at most eight fractional digits
    pub fn validate_price(&self, price: Decimal) -> Result<(), ExchangeError> {
        validate_positive("price", price)
    }

    /// Validates an order quantity: strictly positive, at most eight fractional digits
    pub fn validate_amount(&self, amount: Decimal) -> Result<(), ExchangeError> {
        validate_positive("amount", amount)
    }
}

fn validate_positive(field: &str, value: Decimal) -> Result<(), ExchangeError> {
    if value <= Decimal::ZERO {
        return Err(ExchangeError::InvalidInput(format!(
            "{} must be greater than 0",
            field
        )));
    }
    if !money::fits_scale(value) {
        return Err(ExchangeError::InvalidInput(format!(
            "{} has more than {} fractional digits",
            field,
            money::SCALE
        )));
    }
    Ok(())
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
