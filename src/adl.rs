// 6.0: auto-deleveraging. runs only when the insurance fund could not
// cover a liquidation shortfall. profitable positions on the side opposite
// the liquidated one are ranked and force-reduced at mark price until the
// uncovered remainder is absorbed. the liquidated side itself is never
// touched.

use crate::position::Position;
use crate::types::{PositionId, Price, Quote, Side, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdlParams {
    /// Fraction of a candidate closed per pass (0.2 = 20%).
    pub deleverage_fraction: Decimal,
    /// Cap on candidates touched in one round.
    pub max_positions_per_round: usize,
}

impl Default for AdlParams {
    fn default() -> Self {
        Self {
            deleverage_fraction: dec!(0.2),
            max_positions_per_round: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdlCandidate {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub side: Side,
    pub quantity: Decimal,
    pub unrealized_pnl: Quote,
    /// 0.4 * pnl component + 0.3 * size + 0.3 * leverage, all in [0, 1].
    pub score: Decimal,
}

impl PartialEq for AdlCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.position_id == other.position_id
    }
}

impl Eq for AdlCandidate {}

impl PartialOrd for AdlCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AdlCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // descending by score, position id for stability
        other
            .score
            .cmp(&self.score)
            .then(self.position_id.0.cmp(&other.position_id.0))
    }
}

/// One planned forced reduction.
#[derive(Debug, Clone)]
pub struct AdlAssignment {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub quantity: Decimal,
    pub price: Price,
    /// Profit this reduction realizes toward the shortfall.
    pub coverage: Quote,
}

/// Outcome of one ADL round.
#[derive(Debug, Clone)]
pub struct AdlPlan {
    pub shortfall: Quote,
    pub assignments: Vec<AdlAssignment>,
    /// Left over when even full candidate profits cannot absorb the debt.
    pub uncovered: Quote,
}

// rank opposite-side winners. pnl ratio is profit over margin; size and
// leverage are normalized against the best candidate so each component
// stays in [0, 1] and the 0.4/0.3/0.3 weights mean what they say.
pub fn rank_candidates<'a>(
    positions: impl Iterator<Item = &'a Position>,
    liquidated_side: Side,
    mark: Price,
) -> Vec<AdlCandidate> {
    let target_side = liquidated_side.opposite();
    let pool: Vec<&Position> = positions
        .filter(|p| p.side == target_side && p.is_open())
        .filter(|p| p.unrealized_pnl_at(mark).value() > Decimal::ZERO)
        .collect();

    if pool.is_empty() {
        return Vec::new();
    }

    let max_notional = pool
        .iter()
        .map(|p| p.notional(mark).value())
        .fold(Decimal::ZERO, Decimal::max);
    let max_leverage = pool
        .iter()
        .map(|p| p.leverage.value())
        .fold(Decimal::ZERO, Decimal::max);

    let mut candidates: Vec<AdlCandidate> = pool
        .into_iter()
        .map(|p| {
            let upnl = p.unrealized_pnl_at(mark);
            let pnl_ratio = if p.margin.value().is_zero() {
                Decimal::ZERO
            } else {
                upnl.value() / p.margin.value()
            };
            let size_score = if max_notional.is_zero() {
                Decimal::ZERO
            } else {
                p.notional(mark).value() / max_notional
            };
            let leverage_score = if max_leverage.is_zero() {
                Decimal::ZERO
            } else {
                p.leverage.value() / max_leverage
            };
            let score = dec!(0.4) * pnl_ratio.max(Decimal::ZERO).min(Decimal::ONE)
                + dec!(0.3) * size_score
                + dec!(0.3) * leverage_score;

            AdlCandidate {
                position_id: p.id,
                user_id: p.user_id,
                side: p.side,
                quantity: p.quantity,
                unrealized_pnl: upnl,
                score,
            }
        })
        .collect();

    candidates.sort();
    candidates
}

// 6.1: spread the shortfall across ranked candidates. the first pass takes
// at most the configured fraction of each; if debt remains, a second pass
// may take the rest of each candidate's profitable quantity.
pub fn plan_deleveraging(
    candidates: &[AdlCandidate],
    shortfall: Quote,
    mark: Price,
    params: &AdlParams,
) -> AdlPlan {
    let mut remaining = shortfall.value();
    let mut taken: Vec<Decimal> = vec![Decimal::ZERO; candidates.len()];
    let mut assignments = Vec::new();

    let passes: [Option<Decimal>; 2] = [Some(params.deleverage_fraction), None];
    for cap in passes {
        if remaining <= Decimal::ZERO {
            break;
        }
        for (i, candidate) in candidates
            .iter()
            .enumerate()
            .take(params.max_positions_per_round)
        {
            if remaining <= Decimal::ZERO {
                break;
            }
            if candidate.quantity.is_zero() {
                continue;
            }
            let unit_profit = candidate.unrealized_pnl.value() / candidate.quantity;
            if unit_profit <= Decimal::ZERO {
                continue;
            }

            let available = match cap {
                Some(fraction) => candidate.quantity * fraction - taken[i],
                None => candidate.quantity - taken[i],
            };
            if available <= Decimal::ZERO {
                continue;
            }

            let needed = remaining / unit_profit;
            let close_qty = needed.min(available);
            let coverage = close_qty * unit_profit;

            taken[i] += close_qty;
            remaining -= coverage;
            assignments.push(AdlAssignment {
                position_id: candidate.position_id,
                user_id: candidate.user_id,
                quantity: close_qty,
                price: mark,
                coverage: Quote::new(coverage),
            });
        }
    }

    AdlPlan {
        shortfall,
        assignments,
        uncovered: Quote::new(remaining.max(Decimal::ZERO)),
    }
}
