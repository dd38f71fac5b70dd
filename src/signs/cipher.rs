//! Sign Cipher
//!
//! Caesar-style rotation of sign identifiers over the whole catalog ring.
//! The keyword's first letter picks the rotation (`a` = 1 ... `z` = 26). This
//! is obfuscation for casual players, not cryptography, and must stay
//! bit-for-bit compatible with quest records that were already authored.

use super::catalog::{item_name, SignCatalog};
use super::SignError;

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Rotation amount derived from a keyword
///
/// Empty keywords and the literal `none` (any case) give 0, as does a keyword
/// starting with anything other than an ASCII letter. The keyword is read as
/// stored: a leading space is a non-letter.
pub fn shift(keyword: &str) -> u32 {
    if keyword.is_empty() || keyword.eq_ignore_ascii_case("none") {
        return 0;
    }

    keyword
        .chars()
        .next()
        .map(|c| c.to_ascii_lowercase())
        .and_then(|c| ALPHABET.find(c))
        .map(|index| index as u32 + 1)
        .unwrap_or(0)
}

/// Encode each placed sign independently: `catalog[(index + shift) mod len]`
pub fn encode<S: AsRef<str>>(
    placed: &[S],
    keyword: &str,
    catalog: &SignCatalog,
) -> Result<Vec<String>, SignError> {
    rotate(placed, shift(keyword) as usize, catalog)
}

/// Inverse of [`encode`] for the same keyword and catalog
pub fn decode<S: AsRef<str>>(
    encoded: &[S],
    keyword: &str,
    catalog: &SignCatalog,
) -> Result<Vec<String>, SignError> {
    let len = catalog.len();
    let back = (len - shift(keyword) as usize % len) % len;
    rotate(encoded, back, catalog)
}

fn rotate<S: AsRef<str>>(
    signs: &[S],
    amount: usize,
    catalog: &SignCatalog,
) -> Result<Vec<String>, SignError> {
    let len = catalog.len();

    signs
        .iter()
        .map(|sign| {
            let sign = sign.as_ref();
            let index = catalog
                .index_of(sign)
                .ok_or_else(|| SignError::UnknownSign(sign.to_string()))?;
            let target = (index + amount) % len;
            catalog
                .get(target)
                .map(str::to_string)
                .ok_or_else(|| SignError::UnknownSign(sign.to_string()))
        })
        .collect()
}

/// Canonical reward key stored on the quest and shown to players
pub fn reward_key<S: AsRef<str>>(
    placed: &[S],
    keyword: &str,
    catalog: &SignCatalog,
) -> Result<String, SignError> {
    let encoded = encode(placed, keyword, catalog)?;
    Ok(player_key(&encoded))
}

/// Key built from signs a player entered in the picker
pub fn player_key<S: AsRef<str>>(entered: &[S]) -> String {
    entered
        .iter()
        .map(|sign| item_name(sign.as_ref().trim()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalized keyword for comparisons (`none` means no keyword)
pub fn normalize_keyword(keyword: &str) -> String {
    let keyword = keyword.trim().to_lowercase();
    if keyword == "none" {
        String::new()
    } else {
        keyword
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(names: &[&str]) -> SignCatalog {
        SignCatalog::from_ids(names.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_shift_values() {
        assert_eq!(shift(""), 0);
        assert_eq!(shift("none"), 0);
        assert_eq!(shift("NoNe"), 0);
        assert_eq!(shift("armozel"), 1);
        assert_eq!(shift("paxdei"), 16);
        assert_eq!(shift("Zephyr"), 26);
        assert_eq!(shift("7seas"), 0);
        assert_eq!(shift("éclair"), 0);
    }

    #[test]
    fn test_shift_reads_first_character_as_is() {
        assert_eq!(shift(" b"), 0);
        assert_eq!(shift("\tzulu"), 0);
        assert_eq!(shift("b "), 2);
    }

    #[test]
    fn test_shift_every_letter() {
        for (i, c) in ALPHABET.chars().enumerate() {
            assert_eq!(shift(&format!("{}anything", c)), i as u32 + 1);
            assert_eq!(shift(&c.to_ascii_uppercase().to_string()), i as u32 + 1);
        }
    }

    #[test]
    fn test_encode_wraps_around_ring() {
        let ring = catalog(&["a_one", "a_two", "a_three"]);
        assert_eq!(encode(&["a_one"], "b", &ring).unwrap(), vec!["a_three"]);
        assert_eq!(encode(&["a_three"], "b", &ring).unwrap(), vec!["a_two"]);
        // z = 26 = 2 mod 3
        assert_eq!(encode(&["a_one"], "zulu", &ring).unwrap(), vec!["a_three"]);
    }

    #[test]
    fn test_no_keyword_is_identity() {
        let ring = catalog(&["a_one", "a_two", "b_three", "b_four"]);
        let placed = ["b_four", "a_one", "a_one"];
        for keyword in ["", "none", "NONE", " none "] {
            assert_eq!(encode(&placed, keyword, &ring).unwrap(), placed.to_vec());
        }
    }

    #[test]
    fn test_decode_reverses_encode() {
        let ring = catalog(&["a_1", "a_2", "a_3", "b_4", "b_5", "c_6", "c_7"]);
        let placed = ["c_7", "a_1", "b_5", "a_3", "c_6"];
        for keyword in ["alpha", "paxdei", "zed", "none", "x"] {
            let encoded = encode(&placed, keyword, &ring).unwrap();
            assert_eq!(decode(&encoded, keyword, &ring).unwrap(), placed.to_vec());
        }

        let single = catalog(&["only_one"]);
        let encoded = encode(&["only_one"], "q", &single).unwrap();
        assert_eq!(encoded, vec!["only_one"]);
        assert_eq!(decode(&encoded, "q", &single).unwrap(), vec!["only_one"]);
    }

    #[test]
    fn test_unknown_sign_is_an_error() {
        let ring = catalog(&["a_one", "a_two"]);
        let err = encode(&["a_one", "b_missing"], "c", &ring).unwrap_err();
        assert_eq!(err, SignError::UnknownSign("b_missing".to_string()));
    }

    #[test]
    fn test_reward_key_uses_item_names() {
        let ring = catalog(&["fire_ember", "fire_blaze", "water_deep_tide", "earth_stone"]);
        let key = reward_key(&["fire_ember", "earth_stone"], "beacon", &ring).unwrap();
        assert_eq!(key, "deep_tide,blaze");
        assert_eq!(player_key(&["water_deep_tide", "fire_blaze"]), key);
    }

    #[test]
    fn test_normalize_keyword() {
        assert_eq!(normalize_keyword("  PaxDei "), "paxdei");
        assert_eq!(normalize_keyword("None"), "");
        assert_eq!(normalize_keyword(""), "");
    }
}
