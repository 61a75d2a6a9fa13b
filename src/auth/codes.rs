// Single-use authorization code bookkeeping

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How many redeemed codes are remembered
pub const MAX_REDEEMED_CODES: usize = 10;

/// Shortest code accepted as plausible
pub const MIN_CODE_LENGTH: usize = 10;

/// Bounded history of codes already exchanged, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedeemedCodes {
    codes: VecDeque<String>,
}

impl RedeemedCodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.iter().any(|c| c == code)
    }

    /// Append a code, evicting the oldest entries beyond the bound
    pub fn record(&mut self, code: &str) {
        self.codes.retain(|c| c != code);
        self.codes.push_back(code.to_string());

        while self.codes.len() > MAX_REDEEMED_CODES {
            self.codes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }

    /// Trim a history loaded from storage down to the bound
    pub(crate) fn normalize(mut self) -> Self {
        while self.codes.len() > MAX_REDEEMED_CODES {
            self.codes.pop_front();
        }
        self
    }
}

/// Shape check only: non-blank and long enough
pub fn is_plausible_code(code: &str) -> bool {
    !code.trim().is_empty() && code.chars().count() >= MIN_CODE_LENGTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plausible_code() {
        assert!(!is_plausible_code(""));
        assert!(!is_plausible_code("          "));
        assert!(!is_plausible_code("short"));
        assert!(!is_plausible_code("123456789"));
        assert!(is_plausible_code("1234567890"));
        assert!(is_plausible_code("4/0AX4XfWh-long-code"));
    }

    #[test]
    fn test_record_and_contains() {
        let mut codes = RedeemedCodes::new();
        assert!(!codes.contains("4/0AX4XfWh"));

        codes.record("4/0AX4XfWh");
        assert!(codes.contains("4/0AX4XfWh"));
        assert_eq!(codes.len(), 1);
    }

    #[test]
    fn test_rerecording_moves_code_to_newest() {
        let mut codes = RedeemedCodes::new();
        codes.record("code-aaaaaaaa");
        codes.record("code-bbbbbbbb");
        codes.record("code-aaaaaaaa");

        let order: Vec<&str> = codes.iter().collect();
        assert_eq!(order, vec!["code-bbbbbbbb", "code-aaaaaaaa"]);
    }

    #[test]
    fn test_fifteen_codes_keep_last_ten() {
        let mut codes = RedeemedCodes::new();
        for i in 0..15 {
            codes.record(&format!("auth-code-{:02}", i));
        }

        assert_eq!(codes.len(), MAX_REDEEMED_CODES);
        let kept: Vec<String> = codes.iter().map(str::to_string).collect();
        let expected: Vec<String> = (5..15).map(|i| format!("auth-code-{:02}", i)).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_serialized_as_plain_array() {
        let mut codes = RedeemedCodes::new();
        codes.record("code-aaaaaaaa");
        codes.record("code-bbbbbbbb");

        let json = serde_json::to_string(&codes).unwrap();
        assert_eq!(json, r#"["code-aaaaaaaa","code-bbbbbbbb"]"#);

        let back: RedeemedCodes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, codes);
    }

    #[test]
    fn test_normalize_trims_oversized_history() {
        let json = serde_json::to_string(
            &(0..12).map(|i| format!("code-{:08}", i)).collect::<Vec<_>>(),
        )
        .unwrap();
        let codes: RedeemedCodes = serde_json::from_str(&json).unwrap();
        let codes = codes.normalize();

        assert_eq!(codes.len(), MAX_REDEEMED_CODES);
        assert_eq!(codes.iter().next(), Some("code-00000002"));
    }

    proptest! {
        #[test]
        fn prop_history_is_bounded_and_keeps_latest(
            inputs in proptest::collection::vec("[a-z0-9]{10,16}", 0..40)
        ) {
            let mut codes = RedeemedCodes::new();
            for code in &inputs {
                codes.record(code);
            }

            prop_assert!(codes.len() <= MAX_REDEEMED_CODES);
            if let Some(last) = inputs.last() {
                prop_assert!(codes.contains(last));
                prop_assert_eq!(codes.iter().last(), Some(last.as_str()));
            }
        }
    }
}
