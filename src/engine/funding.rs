// 9.4: the funding cycle. one pass over every listed symbol; each symbol
// settles in isolation, so a missing or stale price on one contract is
// logged and skipped without blocking the others. the tracker's watermark
// makes re-running a tick a no-op.

use super::core::Exchange;
use super::results::{FundingReport, FundingSymbolReport};
use crate::events::{EventPayload, FundingEvent};
use crate::types::Timestamp;

impl Exchange {
    pub fn run_funding_cycle(&self, now: Timestamp) -> FundingReport {
        let mut report = FundingReport::default();
        let symbols: Vec<_> = self.listed_symbols().cloned().collect();

        for symbol in symbols {
            let (mark, index) = match (
                self.prices.mark_price(&symbol),
                self.prices.index_price(&symbol),
            ) {
                (Ok(mark), Ok(index)) => (mark, index),
                (Err(err), _) | (_, Err(err)) => {
                    tracing::warn!(symbol = %symbol, error = %err, "funding skipped");
                    report.skipped.push((symbol, err));
                    continue;
                }
            };

            let mut engine = match self.symbol_engine(&symbol) {
                Ok(engine) => engine.lock(),
                Err(_) => continue,
            };
            let engine = &mut *engine;

            let Some(settlement) =
                engine
                    .funding
                    .settle(engine.positions.open_positions(), mark, index, now)
            else {
                continue;
            };

            // longs pay, shorts receive; sign already carried per payment
            let currency = engine.config.currency.clone();
            for payment in &settlement.payments {
                self.settle_pnl(payment.user_id, &currency, payment.amount.negate());
            }

            tracing::info!(
                symbol = %symbol,
                rate = %settlement.rate.rate,
                positions = settlement.payments.len(),
                "funding settled"
            );
            self.publish(
                now,
                EventPayload::FundingUpdated(FundingEvent {
                    rate: settlement.rate.clone(),
                    positions_settled: settlement.payments.len(),
                }),
            );
            report.settled.push(FundingSymbolReport {
                symbol,
                rate: settlement.rate.rate,
                positions_settled: settlement.payments.len(),
            });
        }

        report
    }
}
