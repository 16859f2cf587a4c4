mod common;

use common::{audit, harness, supply, traded, SYMBOL};
use proptest::prelude::*;
use rust_decimal::Decimal;
use spot_match::{OrderStatus, Side};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Place {
        user_id: u64,
        side: Side,
        price: i64,
        tenths: i64,
    },
    Cancel {
        user_id: u64,
        pick: usize,
    },
    Batch,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1..=4u64, any::<bool>(), 95..=105i64, 1..=5i64).prop_map(|(user_id, buy, price, tenths)| {
            Op::Place {
                user_id,
                side: if buy { Side::Buy } else { Side::Sell },
                price,
                tenths,
            }
        }),
        2 => (1..=4u64, any::<usize>()).prop_map(|(user_id, pick)| Op::Cancel { user_id, pick }),
        1 => Just(Op::Batch),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_flows_keep_the_ledger_sound(ops in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = harness();
            for id in 1..=4u64 {
                h.user(id, Decimal::from(500));
                h.holding(id, "BTC", Decimal::from(2));
            }
            let mut terminal: HashMap<u64, OrderStatus> = HashMap::new();

            for op in ops {
                match op {
                    Op::Place { user_id, side, price, tenths } => {
                        if let Err(e) = h.place(user_id, side, Decimal::from(price), Decimal::new(tenths, 1)).await {
                            assert!(matches!(e.code(), "insufficient_funds" | "insufficient_asset"), "{:?}", e);
                        }
                    }
                    Op::Cancel { user_id, pick } => {
                        let orders = h.ledger.orders();
                        if !orders.is_empty() {
                            let order = &orders[pick % orders.len()];
                            let result = h.engine.cancel_order(user_id, order.id).await;
                            match (order.user_id == user_id, order.status) {
                                (false, _) => assert_eq!(result.unwrap_err().code(), "forbidden"),
                                (true, OrderStatus::Open) => assert!(result.is_ok()),
                                (true, _) => assert_eq!(result.unwrap_err().code(), "invalid_state"),
                            }
                        }
                    }
                    Op::Batch => {
                        h.engine.match_orders(SYMBOL).await.unwrap();
                    }
                }

                for order in h.ledger.orders() {
                    if let Some(status) = terminal.get(&order.id) {
                        assert_eq!(*status, order.status, "order {} left a terminal state", order.id);
                    } else if order.status.is_terminal() {
                        terminal.insert(order.id, order.status);
                    }
                }
                audit(&h.ledger);
            }

            assert_eq!(supply(&h.ledger, "BTC"), Decimal::from(8) + traded(&h.ledger));
            for asset in h.ledger.assets() {
                let open_sells: Decimal = h
                    .ledger
                    .orders()
                    .iter()
                    .filter(|o| o.user_id == asset.user_id && o.side == Side::Sell && o.status == OrderStatus::Open)
                    .map(|o| o.amount)
                    .sum();
                assert!(asset.locked_amount >= open_sells);
            }
        });
    }
}
