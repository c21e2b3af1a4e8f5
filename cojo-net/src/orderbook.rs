// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{NetError, Result};
use crate::negotiation::RoundId;
use crate::protocol::OfferTerms;
use crate::transport::ChannelId;

pub type OfferKey = (String, u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    pub counterparty: String,
    pub channel: ChannelId,
    pub terms: OfferTerms,
    pub received_at: Instant,
}

impl Offer {
    pub fn new(counterparty: &str, channel: ChannelId, terms: OfferTerms) -> Self {
        Self {
            counterparty: counterparty.to_string(),
            channel,
            terms,
            received_at: Instant::now(),
        }
    }

    pub fn key(&self) -> OfferKey {
        (self.counterparty.clone(), self.terms.offer_id)
    }
}

/// Offers from every channel keyed by `(nick, offer id)`. Reserved offers
/// belong to one round until it releases them.
#[derive(Default)]
pub struct Orderbook {
    offers: BTreeMap<OfferKey, Offer>,
    reservations: HashMap<OfferKey, RoundId>,
}

impl Orderbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or supersedes. Returns false when the terms are unchanged.
    pub fn record_offer(&mut self, offer: Offer) -> bool {
        let key = offer.key();
        match self.offers.get_mut(&key) {
            Some(existing) if existing.terms == offer.terms => {
                existing.received_at = offer.received_at;
                existing.channel = offer.channel;
                false
            }
            _ => {
                debug!(nick = %key.0, offer_id = key.1, "offer recorded");
                self.offers.insert(key, offer);
                true
            }
        }
    }

    pub fn cancel(&mut self, counterparty: &str, offer_id: u32) -> Option<Offer> {
        let key = (counterparty.to_string(), offer_id);
        self.reservations.remove(&key);
        self.offers.remove(&key)
    }

    pub fn remove_counterparty(&mut self, counterparty: &str) -> Vec<Offer> {
        let keys: Vec<OfferKey> = self
            .offers
            .keys()
            .filter(|(nick, _)| nick == counterparty)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                self.reservations.remove(&key);
                self.offers.remove(&key)
            })
            .collect()
    }

    pub fn get(&self, counterparty: &str, offer_id: u32) -> Option<&Offer> {
        self.offers.get(&(counterparty.to_string(), offer_id))
    }

    pub fn snapshot(&self) -> Vec<Offer> {
        self.offers.values().cloned().collect()
    }

    pub fn available(&self) -> Vec<Offer> {
        self.offers
            .iter()
            .filter(|(key, _)| !self.reservations.contains_key(*key))
            .map(|(_, offer)| offer.clone())
            .collect()
    }

    pub fn is_reserved(&self, key: &OfferKey) -> bool {
        self.reservations.contains_key(key)
    }

    /// Reserves every key for `round` or none of them.
    pub fn reserve(&mut self, keys: &[OfferKey], round: RoundId) -> Result<()> {
        for key in keys {
            if !self.offers.contains_key(key) {
                return Err(NetError::ProtocolViolation(format!(
                    "offer {}/{} is not in the orderbook",
                    key.0, key.1
                )));
            }
            if let Some(owner) = self.reservations.get(key) {
                if *owner != round {
                    return Err(NetError::ProtocolViolation(format!(
                        "offer {}/{} already reserved by round {owner}",
                        key.0, key.1
                    )));
                }
            }
        }
        for key in keys {
            self.reservations.insert(key.clone(), round);
        }
        Ok(())
    }

    /// Releases everything `round` holds and returns the count.
    pub fn release(&mut self, round: RoundId) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|_, owner| *owner != round);
        before - self.reservations.len()
    }

    pub fn release_key(&mut self, key: &OfferKey, round: RoundId) {
        if self.reservations.get(key) == Some(&round) {
            self.reservations.remove(key);
        }
    }

    /// Drops unreserved offers that reached `max_age`.
    pub fn expire(&mut self, max_age: Duration, now: Instant) -> Vec<OfferKey> {
        let stale: Vec<OfferKey> = self
            .offers
            .iter()
            .filter(|(key, offer)| {
                !self.reservations.contains_key(*key)
                    && now.saturating_duration_since(offer.received_at) >= max_age
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.offers.remove(key);
        }
        stale
    }

    /// When the oldest unreserved offer will reach `max_age`.
    pub fn next_expiry(&self, max_age: Duration) -> Option<Instant> {
        self.offers
            .iter()
            .filter(|(key, _)| !self.reservations.contains_key(*key))
            .map(|(_, offer)| offer.received_at + max_age)
            .min()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}
