// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use cojo_bitcoin::bitcoin::Amount;

use crate::error::{NetError, Result};
use crate::orderbook::Offer;

/// Caps on the coinjoin fee a taker is willing to pay one maker. An offer
/// passes if it is under either cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeLimits {
    pub max_abs: Amount,
    pub max_rel_ppb: u64,
}

impl Default for FeeLimits {
    fn default() -> Self {
        Self {
            max_abs: Amount::from_sat(500),
            max_rel_ppb: 300_000,
        }
    }
}

impl FeeLimits {
    pub fn accepts(&self, fee: Amount, amount: Amount) -> bool {
        if fee <= self.max_abs {
            return true;
        }
        if amount == Amount::ZERO {
            return false;
        }
        let rel = fee.to_sat() as u128 * 1_000_000_000 / amount.to_sat() as u128;
        rel <= self.max_rel_ppb as u128
    }
}

/// Picks `count` offers from distinct counterparties, cheapest first.
/// Offers keep their input order among equal fees.
pub fn select_offers(
    offers: &[Offer],
    amount: Amount,
    count: usize,
    limits: &FeeLimits,
    exclude: &HashSet<String>,
) -> Result<Vec<Offer>> {
    let mut cheapest: HashMap<&str, (usize, Amount)> = HashMap::new();
    for (pos, offer) in offers.iter().enumerate() {
        if exclude.contains(&offer.counterparty) || !offer.terms.accepts(amount) {
            continue;
        }
        let fee = offer.terms.cjfee.fee_for(amount);
        if !limits.accepts(fee, amount) {
            continue;
        }
        cheapest
            .entry(offer.counterparty.as_str())
            .and_modify(|best| {
                if fee < best.1 {
                    *best = (pos, fee);
                }
            })
            .or_insert((pos, fee));
    }

    let mut ranked: Vec<(usize, Amount)> = cheapest.into_values().collect();
    ranked.sort_by_key(|&(pos, fee)| (fee, pos));

    if ranked.len() < count {
        return Err(NetError::InsufficientLiquidity {
            needed: count,
            available: ranked.len(),
        });
    }
    Ok(ranked
        .into_iter()
        .take(count)
        .map(|(pos, _)| offers[pos].clone())
        .collect())
}
