// 9.3: the liquidation cycle. one pass per symbol per tick: revalue every
// open position against the mark, flag and enqueue the ones under the
// maintenance floor, then drain the queue riskiest-first. each drained
// position is force-closed at mark, its fee taken, its shortfall drawn
// from the insurance fund, and whatever the fund could not cover is
// absorbed by deleveraging ranked opposite-side winners.

use super::core::{Exchange, SymbolEngine};
use super::results::{EngineError, LiquidationReport};
use crate::adl::{plan_deleveraging, rank_candidates};
use crate::events::{AdlEvent, EventPayload, LiquidationEvent};
use crate::liquidation::LiquidationQueueEntry;
use crate::risk::RiskFlag;
use crate::types::{Price, Symbol, Timestamp};
use rust_decimal::Decimal;

impl Exchange {
    pub fn run_liquidation_cycle(
        &self,
        symbol: &Symbol,
        now: Timestamp,
    ) -> Result<LiquidationReport, EngineError> {
        let mark = self.prices.mark_price(symbol)?;
        let mut engine = self.symbol_engine(symbol)?.lock();
        let engine = &mut *engine;

        let mut report = LiquidationReport::default();
        engine.positions.revalue_all(mark);

        // sweep: flag positions under the maintenance floor
        let flagged: Vec<_> = engine
            .positions
            .open_positions()
            .map(|p| {
                let flag = engine.risk.check_liquidation_risk(p, mark);
                (p.id, p.margin_ratio, flag)
            })
            .collect();
        report.scanned = flagged.len();

        for (position_id, margin_ratio, flag) in flagged {
            engine.liquidation.reset_closed(position_id);
            match flag {
                RiskFlag::AtRisk { .. } => {
                    engine.liquidation.mark_at_risk(position_id);
                    let position = engine
                        .positions
                        .get(position_id)
                        .expect("flagged position exists")
                        .clone();
                    if engine.liquidation.enqueue(&position, margin_ratio, now) {
                        report.enqueued += 1;
                    }
                }
                _ => engine.liquidation.mark_normal(position_id),
            }
        }

        // drain: force-close riskiest first, bounded per cycle
        let max = engine.liquidation.params().max_per_cycle;
        for _ in 0..max {
            let Some(entry) = engine.liquidation.next(now) else {
                break;
            };
            let record = self.liquidate_one(engine, entry, mark, now)?;
            if record.escalated.value() > Decimal::ZERO {
                self.deleverage(engine, &record, mark, now, &mut report);
            }
            report.liquidated.push(record);
        }

        Ok(report)
    }

    fn liquidate_one(
        &self,
        engine: &mut SymbolEngine,
        entry: LiquidationQueueEntry,
        mark: Price,
        now: Timestamp,
    ) -> Result<crate::liquidation::LiquidationRecord, EngineError> {
        let currency = engine.config.currency.clone();
        let quantity = engine
            .positions
            .get(entry.position_id)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);

        let close = engine
            .positions
            .close_or_reduce(entry.position_id, quantity, mark, now)?;
        let record = engine.liquidation.settle(
            &entry,
            quantity,
            mark,
            close.margin_released,
            close.realized_pnl,
        );

        // the owner keeps whatever equity survives the fee; the fee itself
        // feeds the insurance fund
        let equity = close.margin_released.add(close.realized_pnl);
        if equity.value() > Decimal::ZERO {
            let fee_taken = record.fee.min(equity);
            engine.liquidation.fund_mut().inject(fee_taken);
            let remainder = equity.sub(fee_taken);
            if remainder.value() > Decimal::ZERO {
                self.ledger.credit(entry.user_id, &currency, remainder);
            }
        }

        self.publish(
            now,
            EventPayload::PositionLiquidated(LiquidationEvent {
                position_id: record.position_id,
                user_id: record.user_id,
                symbol: engine.config.symbol.clone(),
                side: record.side,
                quantity: record.quantity,
                mark_price: record.mark_price,
                fee: record.fee,
                shortfall: record.shortfall,
            }),
        );
        Ok(record)
    }

    // absorb an uncovered shortfall by force-reducing ranked winners on the
    // opposite side. each winner keeps released margin and profit net of
    // the coverage their reduction contributed.
    fn deleverage(
        &self,
        engine: &mut SymbolEngine,
        record: &crate::liquidation::LiquidationRecord,
        mark: Price,
        now: Timestamp,
        report: &mut LiquidationReport,
    ) {
        let currency = engine.config.currency.clone();
        let candidates = rank_candidates(engine.positions.open_positions(), record.side, mark);
        let plan = plan_deleveraging(&candidates, record.escalated, mark, &engine.config.adl);

        if plan.uncovered.value() > Decimal::ZERO {
            tracing::warn!(
                symbol = %engine.config.symbol,
                uncovered = %plan.uncovered.value(),
                "adl could not fully absorb shortfall"
            );
        }

        for assignment in plan.assignments {
            let close = match engine.positions.close_or_reduce(
                assignment.position_id,
                assignment.quantity,
                assignment.price,
                now,
            ) {
                Ok(close) => close,
                Err(err) => {
                    tracing::error!(
                        position = assignment.position_id.0,
                        error = %err,
                        "adl close failed"
                    );
                    continue;
                }
            };

            let kept = close
                .margin_released
                .add(close.realized_pnl)
                .sub(assignment.coverage);
            if kept.value() > Decimal::ZERO {
                self.ledger.credit(assignment.user_id, &currency, kept);
            }

            self.publish(
                now,
                EventPayload::PositionAdl(AdlEvent {
                    position_id: assignment.position_id,
                    user_id: assignment.user_id,
                    symbol: engine.config.symbol.clone(),
                    deleveraged_quantity: assignment.quantity,
                    price: assignment.price,
                }),
            );
            report.deleveraged.push(assignment);
        }
    }
}
