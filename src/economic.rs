//! Block reward schedule and money supply

use crate::constants::{COIN, FORK_FOUR, FORK_THREE, TESTNET_FORK_ONE};
use crate::params::Network;

/// Proof-of-work reward for a block at the given height, fees included.
///
/// 50 coins per block, reduced to 25 between the third and fourth hard
/// forks, then halved every million blocks. The testnet pays 25 before its
/// first fork and follows the same halving schedule after.
pub fn proof_of_work_reward(network: Network, height: i32, fees: i64) -> i64 {
    let mut subsidy = 50 * COIN;

    let reduced = match network {
        Network::Mainnet => height >= FORK_THREE && height < FORK_FOUR,
        Network::Testnet => height < TESTNET_FORK_ONE,
    };
    if reduced {
        subsidy = 25 * COIN;
    }

    subsidy >>= (height / 1_000_000) as u32;

    subsidy + fees
}

/// Total coins issued up to and including the given height. The genesis
/// output is counted although it is unspendable.
pub fn money_supply(network: Network, height: i32) -> i64 {
    let h = height as i64;
    match network {
        Network::Mainnet => {
            let fork_three = FORK_THREE as i64;
            let fork_four = FORK_FOUR as i64;
            let mut supply: i64;

            if h < fork_three {
                return (h + 1) * 50 * COIN;
            }
            supply = fork_three * 50 * COIN;

            if h < fork_four {
                return supply + (h - fork_three + 1) * 25 * COIN;
            }
            supply += (fork_four - fork_three) * 25 * COIN;

            if h < 1_000_000 {
                return supply + (h - fork_four + 1) * 50 * COIN;
            }
            supply += (1_000_000 - fork_four) * 50 * COIN;

            if h < 2_000_000 {
                return supply + (h - 1_000_000 + 1) * 25 * COIN;
            }
            supply += 1_000_000 * 25 * COIN;

            if h < 3_000_000 {
                return supply + (h - 2_000_000 + 1) * 25 * COIN / 2;
            }
            supply += 1_000_000 * 25 * COIN / 2;

            if h < 4_000_000 {
                return supply + (h - 3_000_000 + 1) * 25 * COIN / 4;
            }
            supply += 1_000_000 * 25 * COIN / 4;

            supply
        }
        Network::Testnet => {
            let fork_one = TESTNET_FORK_ONE as i64;
            let mut supply: i64;

            if h < fork_one {
                return h * 25 * COIN;
            }
            supply = fork_one * 25 * COIN;

            if h < 1_000_000 {
                return supply + (h - fork_one + 1) * 50 * COIN;
            }
            supply += (1_000_000 - fork_one) * 50 * COIN;

            if h < 2_000_000 {
                return supply + (h - 1_000_000 + 1) * 25 * COIN;
            }
            supply += 1_000_000 * 25 * COIN;

            supply
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_schedule() {
        assert_eq!(proof_of_work_reward(Network::Mainnet, 0, 0), 50 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, FORK_THREE - 1, 0), 50 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, FORK_THREE, 0), 25 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, FORK_FOUR - 1, 0), 25 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, FORK_FOUR, 0), 50 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, 999_999, 0), 50 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, 1_000_000, 0), 25 * COIN);
        assert_eq!(proof_of_work_reward(Network::Mainnet, 2_000_000, 0), 25 * COIN / 2);
        assert_eq!(proof_of_work_reward(Network::Mainnet, 3_000_000, 0), 25 * COIN / 4);
    }

    #[test]
    fn fees_are_added() {
        assert_eq!(proof_of_work_reward(Network::Mainnet, 10, 123), 50 * COIN + 123);
    }

    #[test]
    fn testnet_schedule() {
        assert_eq!(proof_of_work_reward(Network::Testnet, 0, 0), 25 * COIN);
        assert_eq!(proof_of_work_reward(Network::Testnet, TESTNET_FORK_ONE - 1, 0), 25 * COIN);
        assert_eq!(proof_of_work_reward(Network::Testnet, TESTNET_FORK_ONE, 0), 50 * COIN);
        assert_eq!(proof_of_work_reward(Network::Testnet, 1_000_000, 0), 25 * COIN);
    }

    #[test]
    fn supply_is_monotonic_at_boundaries() {
        for h in [
            0,
            FORK_THREE - 1,
            FORK_THREE,
            FORK_FOUR - 1,
            FORK_FOUR,
            999_999,
            1_000_000,
            2_000_000,
        ] {
            let before = money_supply(Network::Mainnet, h);
            let after = money_supply(Network::Mainnet, h + 1);
            assert!(after >= before, "supply decreased at height {}", h);
        }
    }

    #[test]
    fn supply_matches_rewards_near_genesis() {
        // first fork era: 50 coins a block including genesis
        assert_eq!(money_supply(Network::Mainnet, 0), 50 * COIN);
        assert_eq!(money_supply(Network::Mainnet, 9), 10 * 50 * COIN);
    }
}
