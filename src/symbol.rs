//! Canonical trading symbol.
//! Mission: one normalized form everything else keys off of.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonical trading symbol, e.g. `BTC-PERP`.
///
/// Equality and hashing are case-insensitive on the upper-case form;
/// `-PERP`/`-SPOT` suffixes and bare base symbols are all accepted aliases
/// and normalize to the same `Symbol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse any accepted alias (`BTC`, `btc`, `BTC-PERP`, `btc-spot`, ...)
    /// into its canonical base form (upper-case, no suffix).
    pub fn parse(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        let base = upper
            .strip_suffix("-PERP")
            .or_else(|| upper.strip_suffix("-SPOT"))
            .unwrap_or(&upper);
        Symbol(base.to_string())
    }

    /// Base form, e.g. `BTC`.
    pub fn base(&self) -> &str {
        &self.0
    }

    /// Canonical perp form, e.g. `BTC-PERP`, as used by the Price Tape and
    /// Order Pipeline.
    pub fn perp(&self) -> String {
        format!("{}-PERP", self.0)
    }

    /// Canonical spot form, e.g. `BTC-SPOT`.
    pub fn spot(&self) -> String {
        format!("{}-SPOT", self.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Symbol {}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.perp())
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Symbol::parse(raw)
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Symbol::parse(&raw)
    }
}

/// Given a base symbol, return the set of keys (`BASE` and `BASE-PERP`) a
/// lookup table should be populated under so both forms resolve.
///
/// Idempotent: calling this again on either produced key yields the same
/// two-element set.
pub fn normalize_coin_keys(raw: &str) -> [String; 2] {
    let symbol = Symbol::parse(raw);
    [symbol.base().to_string(), symbol.perp()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive_and_strips_suffixes() {
        assert_eq!(Symbol::parse("btc"), Symbol::parse("BTC-PERP"));
        assert_eq!(Symbol::parse("Btc-Spot"), Symbol::parse("BTC"));
    }

    #[test]
    fn round_trips_through_perp_form() {
        let s = Symbol::parse("eth");
        assert_eq!(Symbol::parse(&s.perp()), s);
    }

    #[test]
    fn normalize_coin_keys_contains_both_forms_and_is_closed_under_repetition() {
        let keys = normalize_coin_keys("sol-perp");
        assert!(keys.contains(&"SOL".to_string()));
        assert!(keys.contains(&"SOL-PERP".to_string()));

        let keys_again = normalize_coin_keys(&keys[1]);
        assert_eq!(keys, keys_again);
    }
}
