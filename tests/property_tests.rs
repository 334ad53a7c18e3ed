//! Property-based tests for the matching and risk invariants.
//!
//! These verify the ordering, conservation, liquidation and funding
//! invariants hold under randomized inputs.

use exchange_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $1 to $10,000
}

fn size_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000i64).prop_map(|x| Decimal::new(x, 4)) // 0.0001 to 1.0
}

fn leverage_strategy() -> impl Strategy<Value = Decimal> {
    (1u32..=50u32).prop_map(Decimal::from)
}

fn limit(id: u64, side: Side, price: Decimal, qty: Decimal, ts: i64) -> Order {
    Order::new_limit(
        OrderId(id),
        UserId(id),
        Symbol::new("BTC-PERP"),
        side,
        qty,
        Price::new_unchecked(price),
        Leverage::new(dec!(10)).unwrap(),
        Quote::new(qty * price / dec!(10)),
        TimeInForce::GTC,
        Timestamp::from_millis(ts),
    )
}

proptest! {
    /// Best price always equals the true extreme of live order prices,
    /// under any interleaving of inserts and cancels.
    #[test]
    fn best_price_matches_live_orders(
        ops in prop::collection::vec(
            ((1i64..100i64), (1i64..100i64), any::<bool>(), any::<bool>()),
            1..40,
        ),
    ) {
        let mut book = OrderBook::new(Symbol::new("BTC-PERP"));
        let mut next_id = 1u64;

        for (price_ticks, qty_ticks, is_buy, cancel_oldest) in ops {
            let side = if is_buy { Side::Buy } else { Side::Sell };
            let price = Decimal::from(price_ticks) * dec!(10);
            let qty = Decimal::new(qty_ticks, 2);
            book.insert(limit(next_id, side, price, qty, next_id as i64)).unwrap();
            next_id += 1;

            if cancel_oldest {
                if let Some(id) = book.orders().map(|o| o.id).min() {
                    book.remove(id).unwrap();
                }
            }

            for side in [Side::Buy, Side::Sell] {
                let live_extreme = book
                    .orders()
                    .filter(|o| o.side == side)
                    .map(|o| o.price.unwrap().value())
                    .reduce(|a, b| match side {
                        Side::Buy => a.max(b),
                        Side::Sell => a.min(b),
                    });
                prop_assert_eq!(
                    book.best_price(side).map(|p| p.value()),
                    live_extreme
                );
            }
            prop_assert!(book.verify_totals());
        }
    }

    /// filled + remaining == original quantity for every taker.
    #[test]
    fn quantity_is_conserved(
        maker_qtys in prop::collection::vec(1i64..500i64, 1..10),
        taker_qty in 1i64..3000i64,
    ) {
        let mut engine = MatchingEngine::new(Symbol::new("BTC-PERP"));
        let mut id = 1u64;
        for qty in &maker_qtys {
            let order = limit(id, Side::Sell, dec!(50000), Decimal::new(*qty, 2), id as i64);
            engine.process_order(order, Timestamp::from_millis(id as i64)).unwrap();
            id += 1;
        }

        let original = Decimal::new(taker_qty, 2);
        let taker = Order::new_market(
            OrderId(id),
            UserId(id),
            Symbol::new("BTC-PERP"),
            Side::Buy,
            original,
            Leverage::new(dec!(10)).unwrap(),
            Quote::new(original * dec!(5000)),
            Timestamp::from_millis(1000),
        );
        let result = engine.process_order(taker, Timestamp::from_millis(1000)).unwrap();

        prop_assert_eq!(result.filled_quantity() + result.remaining_quantity, original);
        prop_assert!(engine.book().verify_totals());
    }

    /// FOK either fills fully or leaves the book untouched.
    #[test]
    fn fok_is_all_or_nothing(
        maker_qtys in prop::collection::vec(1i64..500i64, 1..8),
        taker_qty in 1i64..3000i64,
    ) {
        let mut engine = MatchingEngine::new(Symbol::new("BTC-PERP"));
        let mut id = 1u64;
        let mut liquidity = Decimal::ZERO;
        for qty in &maker_qtys {
            let q = Decimal::new(*qty, 2);
            liquidity += q;
            let order = limit(id, Side::Sell, dec!(50000), q, id as i64);
            engine.process_order(order, Timestamp::from_millis(id as i64)).unwrap();
            id += 1;
        }

        let original = Decimal::new(taker_qty, 2);
        let mut taker = limit(id, Side::Buy, dec!(50000), original, 1000);
        taker.time_in_force = TimeInForce::FOK;
        let before: Decimal = engine.book().orders().map(|o| o.remaining()).sum();
        let result = engine.process_order(taker, Timestamp::from_millis(1000)).unwrap();
        let after: Decimal = engine.book().orders().map(|o| o.remaining()).sum();

        if original <= liquidity {
            prop_assert_eq!(result.status, OrderStatus::Filled);
            prop_assert_eq!(before - after, original);
        } else {
            prop_assert_eq!(result.status, OrderStatus::Rejected);
            prop_assert!(result.trades.is_empty());
            prop_assert_eq!(before, after);
        }
    }

    /// A position is flagged at-risk if and only if equity is below
    /// maintenance margin.
    #[test]
    fn liquidation_fires_iff_margin_ratio_below_one(
        entry in price_strategy(),
        mark in price_strategy(),
        qty in size_strategy(),
        lev in leverage_strategy(),
    ) {
        let symbol = Symbol::new("BTC-PERP");
        let params = MarginParams::default();
        let mut manager = PositionManager::new(symbol.clone(), params.clone());
        let risk = RiskEngine::new(symbol, RiskParams::default(), params.clone());

        let leverage = Leverage::new(lev).unwrap();
        let margin = initial_margin(
            notional_value(qty, Price::new_unchecked(entry)),
            leverage,
        );
        let outcome = manager
            .apply_fill(
                UserId(1),
                Side::Buy,
                qty,
                Price::new_unchecked(entry),
                leverage,
                margin,
                Timestamp::from_millis(0),
            )
            .unwrap();
        let position = manager.get(outcome.opened.unwrap()).unwrap();

        let mark_price = Price::new_unchecked(mark);
        let equity = margin.value() + (mark - entry) * qty;
        let maintenance = qty * mark * params.maintenance_margin_ratio;

        let flag = risk.check_liquidation_risk(position, mark_price);
        if equity < maintenance {
            prop_assert!(
                matches!(flag, RiskFlag::AtRisk { .. }),
                "expected AtRisk, got {:?}",
                flag
            );
        } else {
            prop_assert!(
                !matches!(flag, RiskFlag::AtRisk { .. }),
                "expected not AtRisk, got {:?}",
                flag
            );
        }
    }

    /// Funding is zero-sum no matter how long and short open interest line
    /// up, including after forced closes have emptied one side entirely.
    #[test]
    fn funding_is_zero_sum(
        long_qtys in prop::collection::vec(1i64..1000i64, 0..6),
        short_qtys in prop::collection::vec(1i64..1000i64, 0..6),
        premium_ticks in -100i64..100i64,
    ) {
        prop_assume!(!long_qtys.is_empty() || !short_qtys.is_empty());

        let symbol = Symbol::new("BTC-PERP");
        let mut manager = PositionManager::new(symbol.clone(), MarginParams::default());
        let entry = Price::new_unchecked(dec!(50000));

        let mut user = 1u64;
        for (qtys, side) in [(&long_qtys, Side::Buy), (&short_qtys, Side::Sell)] {
            for qty in qtys.iter() {
                let q = Decimal::new(*qty, 2);
                manager
                    .apply_fill(
                        UserId(user),
                        side,
                        q,
                        entry,
                        Leverage::new(dec!(10)).unwrap(),
                        Quote::new(q * dec!(5000)),
                        Timestamp::from_millis(0),
                    )
                    .unwrap();
                user += 1;
            }
        }

        let mut tracker = FundingTracker::new(symbol, FundingParams::default());
        let mark = Price::new_unchecked(dec!(50000) + Decimal::new(premium_ticks, 0));
        let settlement = tracker
            .settle(
                manager.open_positions(),
                mark,
                Price::new_unchecked(dec!(50000)),
                Timestamp::from_millis(0),
            )
            .unwrap();

        let net: Decimal = settlement.payments.iter().map(|p| p.amount.value()).sum();
        prop_assert_eq!(net, Decimal::ZERO);
        prop_assert_eq!(
            settlement.total_paid_by_longs.value(),
            settlement.total_received_by_shorts.value()
        );
    }

    /// ADL never selects the liquidated side, and planned coverage never
    /// exceeds the shortfall.
    #[test]
    fn adl_respects_side_and_shortfall(
        long_qtys in prop::collection::vec(1i64..500i64, 0..5),
        short_qtys in prop::collection::vec(1i64..500i64, 1..5),
        shortfall_ticks in 1i64..100_000i64,
    ) {
        let symbol = Symbol::new("BTC-PERP");
        let mut manager = PositionManager::new(symbol, MarginParams::default());
        let entry = Price::new_unchecked(dec!(50000));
        let mut user = 1u64;
        for (qtys, side) in [(&long_qtys, Side::Buy), (&short_qtys, Side::Sell)] {
            for qty in qtys.iter() {
                let q = Decimal::new(*qty, 2);
                manager
                    .apply_fill(UserId(user), side, q, entry,
                        Leverage::new(dec!(10)).unwrap(),
                        Quote::new(q * dec!(5000)),
                        Timestamp::from_millis(0))
                    .unwrap();
                user += 1;
            }
        }

        // a long was liquidated at a lower mark; shorts are the winners
        let mark = Price::new_unchecked(dec!(45000));
        let candidates = rank_candidates(manager.open_positions(), Side::Buy, mark);
        prop_assert!(candidates.iter().all(|c| c.side == Side::Sell));

        let shortfall = Quote::new(Decimal::new(shortfall_ticks, 1));
        let plan = plan_deleveraging(&candidates, shortfall, mark, &AdlParams::default());
        let covered: Decimal = plan.assignments.iter().map(|a| a.coverage.value()).sum();
        prop_assert!(covered <= shortfall.value());
        prop_assert_eq!(covered + plan.uncovered.value(), shortfall.value());
    }
}
