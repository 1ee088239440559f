//! The fixed estimation card deck.

/// Selectable card values, in display order.
///
/// Fibonacci-like scale; "unknown / too large" is not a separate symbol.
pub const CARD_DECK: [u32; 11] = [0, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89];

/// Whether `points` is a card in the deck.
#[must_use]
pub fn is_card(points: u32) -> bool {
    CARD_DECK.contains(&points)
}
