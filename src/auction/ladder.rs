use super::Amount;

/// `(upper price bound, increment)`, ascending.
const BANDS: &[(Amount, Amount)] = &[
    (1_000, 10),
    (2_000, 100),
    (5_000, 250),
    (7_500, 500),
    (10_000, 750),
    (20_000, 1_000),
    (50_000, 5_000),
    (100_000, 10_000),
    (200_000, 25_000),
    (500_000, 50_000),
    (1_000_000, 100_000),
    (2_000_000, 250_000),
    (5_000_000, 500_000),
    (10_000_000, 1_000_000),
    (20_000_000, 2_500_000),
    (50_000_000, 5_000_000),
    (100_000_000, 10_000_000),
    (200_000_000, 25_000_000),
    (500_000_000, 50_000_000),
];

const TOP_INCREMENT: Amount = 100_000_000;

/// Minimum raise over `current_price`
pub fn minimum_increment(current_price: Amount) -> Amount {
    BANDS
        .iter()
        .find(|(below, _)| current_price < *below)
        .map(|(_, increment)| *increment)
        .unwrap_or(TOP_INCREMENT)
}
