//! Exchange core simulation.
//!
//! Walks the full engine lifecycle on one symbol: matching, position
//! tracking, a liquidation with insurance-fund draw, ADL escalation, and a
//! funding settlement.

use exchange_core::*;
use rust_decimal_macros::dec;
use std::sync::Arc;

const SYM: &str = "BTC-PERP";
const USDT: &str = "USDT";

struct Sim {
    exchange: Exchange,
    ledger: Arc<InMemoryLedger>,
    feed: Arc<InMemoryPriceFeed>,
    clock: i64,
}

impl Sim {
    fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let feed = Arc::new(InMemoryPriceFeed::new(0));
        let mut config = SymbolConfig::new(SYM);
        config.risk.min_order_interval_ms = 0;
        config.initial_insurance = Quote::new(dec!(500));
        let exchange = Exchange::new(
            ExchangeConfig::single(config),
            ledger.clone(),
            feed.clone(),
        );
        Self {
            exchange,
            ledger,
            feed,
            clock: 0,
        }
    }

    fn now(&mut self) -> Timestamp {
        self.clock += 100;
        Timestamp::from_millis(self.clock)
    }

    fn set_price(&mut self, mark: rust_decimal::Decimal, index: rust_decimal::Decimal) {
        let now = self.now();
        self.feed.publish(
            Symbol::new(SYM),
            Price::new_unchecked(mark),
            Price::new_unchecked(index),
            now,
        );
    }

    fn fund(&self, user: u64, amount: rust_decimal::Decimal) {
        self.ledger.deposit(UserId(user), USDT, Quote::new(amount));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("exchange-core simulation: one symbol, full lifecycle\n");

    scenario_matching();
    scenario_liquidation();
    scenario_adl();
    scenario_funding();

    println!("\ndone");
}

/// Resting bid, partial fill at the maker's price.
fn scenario_matching() {
    println!("-- matching --");
    let mut sim = Sim::new();
    let symbol = Symbol::new(SYM);
    sim.set_price(dec!(50000), dec!(50000));
    sim.fund(1, dec!(50000));
    sim.fund(2, dec!(50000));

    let now = sim.now();
    let buy = sim
        .exchange
        .submit_order(
            &symbol,
            OrderRequest::limit(
                UserId(1),
                Side::Buy,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                TimeInForce::GTC,
            ),
            now,
        )
        .unwrap();
    println!("buy 1.0 @ 50000: status {:?}, resting {}", buy.status, buy.resting);

    let snap = sim.exchange.order_book_snapshot(&symbol, 5).unwrap();
    println!(
        "book: bid level ({}, {}, {} order)",
        snap.bids[0].price.value(),
        snap.bids[0].total_quantity,
        snap.bids[0].order_count
    );

    let now = sim.now();
    let sell = sim
        .exchange
        .submit_order(
            &symbol,
            OrderRequest::limit(
                UserId(2),
                Side::Sell,
                dec!(0.5),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                TimeInForce::GTC,
            ),
            now,
        )
        .unwrap();
    println!(
        "sell 0.5 @ 50000: {} trade at {}, buyer remainder {}",
        sell.trades.len(),
        sell.trades[0].price.value(),
        sim.exchange
            .order_book_snapshot(&symbol, 5)
            .unwrap()
            .bids[0]
            .total_quantity
    );
}

/// Long at 10x; the mark drops through the liquidation price.
fn scenario_liquidation() {
    println!("\n-- liquidation --");
    let mut sim = Sim::new();
    let symbol = Symbol::new(SYM);
    sim.set_price(dec!(50000), dec!(50000));
    sim.fund(1, dec!(10000));
    sim.fund(2, dec!(100000));

    // maker provides the ask, taker goes long 1.0 at 10x
    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::limit(
                UserId(2),
                Side::Sell,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                TimeInForce::GTC,
            ),
            now,
        )
        .unwrap();
    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::market(UserId(1), Side::Buy, dec!(1), Leverage::new(dec!(10)).unwrap()),
            now,
        )
        .unwrap();

    let position = sim
        .exchange
        .position(UserId(1), &symbol, Side::Buy)
        .unwrap()
        .unwrap();
    println!(
        "long 1.0 @ {}, liquidation price {}",
        position.entry_price.value(),
        position.liquidation_price.unwrap().value()
    );

    // mark falls below the 45025 trigger
    sim.set_price(dec!(45000), dec!(45000));
    let now = sim.now();
    let report = sim.exchange.run_liquidation_cycle(&symbol, now).unwrap();
    println!(
        "cycle at 45000: scanned {}, liquidated {}, fee {}",
        report.scanned,
        report.liquidated.len(),
        report.liquidated[0].fee.value()
    );
    println!(
        "insurance fund after: {}",
        sim.exchange.insurance_fund(&symbol).unwrap().balance.value()
    );
}

/// Empty insurance fund: the shortfall lands on opposite-side winners.
fn scenario_adl() {
    println!("\n-- adl --");
    let mut sim = Sim::new();
    let symbol = Symbol::new(SYM);
    sim.set_price(dec!(50000), dec!(50000));
    sim.fund(1, dec!(10000));
    sim.fund(2, dec!(100000));

    // 20x long against a 5x short; the coming gap leaves more bad debt
    // than the 500 seeded in the fund
    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::limit(
                UserId(2),
                Side::Sell,
                dec!(2),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(5)).unwrap(),
                TimeInForce::GTC,
            ),
            now,
        )
        .unwrap();
    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::market(UserId(1), Side::Buy, dec!(2), Leverage::new(dec!(20)).unwrap()),
            now,
        )
        .unwrap();

    // gap through the bankruptcy price: bad debt exceeds the 500 in the fund
    sim.set_price(dec!(46000), dec!(46000));
    let now = sim.now();
    let report = sim.exchange.run_liquidation_cycle(&symbol, now).unwrap();
    let record = &report.liquidated[0];
    println!(
        "shortfall {}, fund covered {}, escalated {}",
        record.shortfall.value(),
        record.covered_by_fund.value(),
        record.escalated.value()
    );
    for assignment in &report.deleveraged {
        println!(
            "adl: user {:?} reduced {} @ {}",
            assignment.user_id,
            assignment.quantity,
            assignment.price.value()
        );
    }
}

/// Premium above index; longs pay shorts, zero sum.
fn scenario_funding() {
    println!("\n-- funding --");
    let mut sim = Sim::new();
    let symbol = Symbol::new(SYM);
    sim.set_price(dec!(50000), dec!(50000));
    sim.fund(1, dec!(50000));
    sim.fund(2, dec!(50000));

    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::limit(
                UserId(2),
                Side::Sell,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                TimeInForce::GTC,
            ),
            now,
        )
        .unwrap();
    let now = sim.now();
    sim.exchange
        .submit_order(
            &symbol,
            OrderRequest::market(UserId(1), Side::Buy, dec!(1), Leverage::new(dec!(10)).unwrap()),
            now,
        )
        .unwrap();

    // perp trades 0.1% rich
    sim.set_price(dec!(50050), dec!(50000));
    let now = sim.now();
    let report = sim.exchange.run_funding_cycle(now);
    let settled = &report.settled[0];
    println!(
        "rate {}, positions settled {}",
        settled.rate, settled.positions_settled
    );
    println!(
        "current rate on {}: {}",
        SYM,
        sim.exchange.funding_rate(&symbol).unwrap().unwrap().rate
    );
}
