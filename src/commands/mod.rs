// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod config;
pub mod inputs;
pub mod orderbook;

use cojo_net::protocol::format_relative_fee;
use cojo_net::CjFee;

fn describe_fee(fee: &CjFee) -> String {
    match fee {
        CjFee::Relative(ppb) => format!("{} rel", format_relative_fee(*ppb)),
        CjFee::Absolute(amount) => format!("{} sat", amount.to_sat()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojo_bitcoin::bitcoin::Amount;

    #[test]
    fn test_describe_fee() {
        assert_eq!(describe_fee(&CjFee::Relative(200_000)), "0.0002 rel");
        assert_eq!(
            describe_fee(&CjFee::Absolute(Amount::from_sat(750))),
            "750 sat"
        );
    }
}
