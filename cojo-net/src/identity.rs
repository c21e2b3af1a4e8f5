// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use cojo_bitcoin::bitcoin::secp256k1::PublicKey;
use cojo_bitcoin::nick_matches_pubkey;
use tracing::warn;

use crate::codec::AssembledCommand;
use crate::error::{NetError, Result};
use crate::transport::ChannelId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterpartyId(u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Counterparty {
    pub id: CounterpartyId,
    pub nick: String,
    pub claimed_pubkey: Option<PublicKey>,
    pub verified: bool,
    pub channel: ChannelId,
}

/// Counterparties seen on one channel. Entries live until the nick
/// leaves the channel.
pub struct CounterpartyArena {
    channel: ChannelId,
    next_id: u64,
    by_nick: HashMap<String, CounterpartyId>,
    entries: HashMap<CounterpartyId, Counterparty>,
}

impl CounterpartyArena {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            next_id: 0,
            by_nick: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    pub fn sighted(&mut self, nick: &str) -> CounterpartyId {
        if let Some(id) = self.by_nick.get(nick) {
            return *id;
        }
        let id = CounterpartyId(self.next_id);
        self.next_id += 1;
        self.by_nick.insert(nick.to_string(), id);
        self.entries.insert(
            id,
            Counterparty {
                id,
                nick: nick.to_string(),
                claimed_pubkey: None,
                verified: false,
                channel: self.channel,
            },
        );
        id
    }

    pub fn get(&self, id: CounterpartyId) -> Option<&Counterparty> {
        self.entries.get(&id)
    }

    pub fn by_nick(&self, nick: &str) -> Option<&Counterparty> {
        self.by_nick.get(nick).and_then(|id| self.entries.get(id))
    }

    pub fn verified_key(&self, nick: &str) -> Option<PublicKey> {
        self.by_nick(nick)
            .filter(|c| c.verified)
            .and_then(|c| c.claimed_pubkey)
    }

    /// Checks the signature on `assembled` and returns the sender's id.
    ///
    /// The first valid signature binds the nick to its key; after that
    /// only that key is accepted. `pinned` is a key the nick already holds
    /// on another channel and is treated like a local binding.
    pub fn authenticate(
        &mut self,
        assembled: &AssembledCommand,
        channel_tag: &str,
        pinned: Option<&PublicKey>,
    ) -> Result<CounterpartyId> {
        let nick = assembled.sender.as_str();
        let id = self.sighted(nick);
        let bound = self.verified_key(nick).or(pinned.copied());

        match bound {
            Some(key) => {
                if assembled.pubkey != key || !assembled.verify_with(channel_tag, &key) {
                    warn!(
                        channel = %self.channel,
                        nick,
                        command = %assembled.command.name,
                        "signature does not match bound key"
                    );
                    return Err(NetError::AuthenticationFailure(format!(
                        "{nick} signed with a key other than its bound key"
                    )));
                }
            }
            None => {
                if !nick_matches_pubkey(nick, &assembled.pubkey) {
                    warn!(channel = %self.channel, nick, "nick not derived from claimed key");
                    return Err(NetError::AuthenticationFailure(format!(
                        "{nick} is not derived from its claimed key"
                    )));
                }
                if !assembled.verify_with(channel_tag, &assembled.pubkey) {
                    warn!(channel = %self.channel, nick, "invalid signature on first message");
                    return Err(NetError::AuthenticationFailure(format!(
                        "{nick} sent an invalid signature"
                    )));
                }
            }
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            if !entry.verified {
                entry.claimed_pubkey = Some(assembled.pubkey);
                entry.verified = true;
            }
        }
        Ok(id)
    }

    pub fn remove(&mut self, nick: &str) -> Option<Counterparty> {
        let id = self.by_nick.remove(nick)?;
        self.entries.remove(&id)
    }

    pub fn clear(&mut self) {
        self.by_nick.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys of verified nicks across all channels, held while the nick is
/// present on at least one of them.
#[derive(Default)]
pub struct IdentityRegistry {
    bindings: HashMap<String, (PublicKey, HashSet<ChannelId>)>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_for(&self, nick: &str) -> Option<&PublicKey> {
        self.bindings.get(nick).map(|(k, _)| k)
    }

    pub fn bind(&mut self, nick: &str, key: PublicKey, channel: ChannelId) -> Result<()> {
        match self.bindings.get_mut(nick) {
            Some((existing, channels)) => {
                if *existing != key {
                    return Err(NetError::AuthenticationFailure(format!(
                        "{nick} already bound to a different key"
                    )));
                }
                channels.insert(channel);
            }
            None => {
                self.bindings
                    .insert(nick.to_string(), (key, HashSet::from([channel])));
            }
        }
        Ok(())
    }

    /// Returns true when the nick is no longer present anywhere.
    pub fn release(&mut self, nick: &str, channel: ChannelId) -> bool {
        let gone = match self.bindings.get_mut(nick) {
            Some((_, channels)) => {
                channels.remove(&channel);
                channels.is_empty()
            }
            None => return true,
        };
        if gone {
            self.bindings.remove(nick);
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, Command, Reassembler};
    use cojo_bitcoin::{IdentityKey, KeySource};
    use proptest::prelude::*;
    use tokio::time::Instant;

    fn assembled(key: &IdentityKey, nick: &str, tag: &str) -> AssembledCommand {
        let cmd = Command::new("orderbook", vec![]);
        let lines = encode(key, nick, tag, &cmd, 0, 400).unwrap();
        Reassembler::new()
            .push(nick, &lines[0], Instant::now())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_first_message_binds_key() {
        let key = IdentityKey::generate();
        let nick = key.nick(0);
        let mut arena = CounterpartyArena::new(ChannelId(0));

        let id = arena.authenticate(&assembled(&key, &nick, "t"), "t", None).unwrap();
        let entry = arena.get(id).unwrap();
        assert!(entry.verified);
        assert_eq!(entry.claimed_pubkey, Some(key.public_key()));
    }

    #[test]
    fn test_nick_not_derived_from_key_rejected() {
        let key = IdentityKey::generate();
        let mut arena = CounterpartyArena::new(ChannelId(0));
        let result = arena.authenticate(&assembled(&key, "CJ1impostor", "t"), "t", None);
        assert!(matches!(result, Err(NetError::AuthenticationFailure(_))));
        assert!(!arena.by_nick("CJ1impostor").unwrap().verified);
    }

    #[test]
    fn test_pinned_key_from_other_channel_enforced() {
        let key = IdentityKey::generate();
        let other = IdentityKey::generate();
        let nick = key.nick(0);
        let mut arena = CounterpartyArena::new(ChannelId(1));
        let pinned = other.public_key();
        assert!(arena
            .authenticate(&assembled(&key, &nick, "t"), "t", Some(&pinned))
            .is_err());
    }

    #[test]
    fn test_registry_release_tracks_channels() {
        let key = IdentityKey::generate();
        let other = IdentityKey::generate();
        let mut registry = IdentityRegistry::new();
        registry.bind("n", key.public_key(), ChannelId(0)).unwrap();
        registry.bind("n", key.public_key(), ChannelId(1)).unwrap();
        assert!(registry.bind("n", other.public_key(), ChannelId(2)).is_err());

        assert!(!registry.release("n", ChannelId(0)));
        assert!(registry.release("n", ChannelId(1)));
        assert!(registry.key_for("n").is_none());
        registry.bind("n", other.public_key(), ChannelId(2)).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn binding_survives_foreign_keys(
            a in prop::array::uniform32(1u8..=255),
            b in prop::array::uniform32(1u8..=255),
        ) {
            prop_assume!(a != b);
            let owner = IdentityKey::from_secret_bytes(&a).unwrap();
            let intruder = IdentityKey::from_secret_bytes(&b).unwrap();
            let nick = owner.nick(0);
            let mut arena = CounterpartyArena::new(ChannelId(0));

            arena.authenticate(&assembled(&owner, &nick, "t"), "t", None).unwrap();
            let forged = assembled(&intruder, &nick, "t");
            prop_assert!(arena.authenticate(&forged, "t", None).is_err());

            let entry = arena.by_nick(&nick).unwrap();
            prop_assert!(entry.verified);
            prop_assert_eq!(entry.claimed_pubkey, Some(owner.public_key()));
            prop_assert!(arena.authenticate(&assembled(&owner, &nick, "t"), "t", None).is_ok());
        }
    }
}
