//! Match Engine Module
//!
//! This module contains the core components of the matching engine system:
//! - `data`: Order book views in price-time priority
//! - `entry`: Orders, trades, holdings, symbols and fixed-point helpers
//! - `matchengine`: The transactional facade exposed to callers
//! - `matchlogic`: Immediate and batch matching policies
//! - `spot`: Order lifecycle, fund reservation and settlement
//! - `store`: Transactional ledger backends

pub mod data;
pub mod entry;
pub mod matchengine;
pub mod matchlogic;
pub mod spot;
pub mod store;
