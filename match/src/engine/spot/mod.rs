//! Spot Market Module
//!
//! This module provides functionality for spot market trading:
//! - `order_processor`: Processes orders and manages their lifecycle
//! - `reservation`: Holds back and returns the funds behind open orders
//! - `settlement`: Books a matched pair into trades, balances and holdings

pub mod order_processor;
pub mod reservation;
pub mod settlement;

pub use order_processor::{OrderPreview, OrderProcessor, OrderRequest};
pub use reservation::FundReservation;
pub use settlement::{SettlementWriter, COMMISSION_RATE};
