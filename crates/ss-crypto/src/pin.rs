//! PIN generation, checksum validation and word encoding
//!
//! PIN layout (12 symbols from a 55-symbol alphabet):
//! ```text
//! [1: method][9: entropy][2: checksum over symbols 1..=10]
//! ```
//! Method indicator: uppercase = relay, lowercase = cloud broker, `2` = manual/QR.

use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::Duration;
use zeroize::Zeroize;

use ss_core::{now_millis, SsError, SsResult, TransportMethod};

/// Symbols a PIN may contain. Look-alikes (0 1 I O i l o) are excluded.
pub const ALPHABET: &[u8; 55] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz";

/// One word per alphabet symbol, in alphabet order.
pub const WORDS: [&str; 55] = [
    "amber", "bison", "cedar", "delta", "ember", "falcon", "garnet", "harbor", "ivory", "jasper",
    "kayak", "lemon", "maple", "nectar", "olive", "pepper", "quartz", "raven", "saddle", "timber",
    "umber", "velvet", "walnut", "xenon", "yonder", "zephyr", "anchor", "breeze", "canyon", "dingo",
    "eagle", "fjord", "glacier", "hazel", "igloo", "jungle", "koala", "lagoon", "meadow", "nugget",
    "orchid", "pebble", "quiver", "ripple", "salmon", "tundra", "uplift", "violet", "willow",
    "yarrow", "zinnia", "basil", "comet", "dune", "fable",
];

pub const PIN_LEN: usize = 12;
const ENTROPY_LEN: usize = 9;
const CHECKSUM_LEN: usize = 2;
const BASE: u32 = ALPHABET.len() as u32;

/// A validated transfer PIN.
///
/// The text is secret key material: it is zeroized on drop and never printed
/// by `Debug`.
#[derive(Clone)]
pub struct Pin {
    text: String,
    method: TransportMethod,
    expires_at: Option<u64>,
}

impl Pin {
    /// Parse and validate PIN text, rejecting any structural or checksum error.
    pub fn parse(text: &str) -> SsResult<Self> {
        let text = text.trim();
        let bytes = text.as_bytes();
        if bytes.len() != PIN_LEN {
            return Err(SsError::InvalidPin(format!(
                "expected {PIN_LEN} characters, got {}",
                text.chars().count()
            )));
        }
        if let Some(bad) = bytes.iter().find(|b| symbol_index(**b).is_none()) {
            return Err(SsError::InvalidPin(format!(
                "character '{}' is not allowed",
                char::from(*bad)
            )));
        }
        let method = method_for(bytes[0]).ok_or_else(|| {
            SsError::InvalidPin(format!("'{}' is not a transport indicator", char::from(bytes[0])))
        })?;
        let body = &bytes[..PIN_LEN - CHECKSUM_LEN];
        if checksum(body) != bytes[PIN_LEN - CHECKSUM_LEN..] {
            return Err(SsError::InvalidPin("checksum mismatch (typo?)".into()));
        }
        Ok(Self {
            text: text.to_string(),
            method,
            expires_at: None,
        })
    }

    pub fn method(&self) -> TransportMethod {
        self.method
    }

    /// The secret text. Callers feed this to the KDF, nowhere else.
    pub fn expose(&self) -> &str {
        &self.text
    }

    /// Stamp an expiry `ttl` from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(now_millis().saturating_add(ttl.as_millis() as u64));
        self
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| now_ms > at)
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.text.zeroize();
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("method", &self.method)
            .field("text", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Pin {}

fn symbol_index(b: u8) -> Option<usize> {
    ALPHABET.iter().position(|&s| s == b)
}

fn method_for(indicator: u8) -> Option<TransportMethod> {
    match indicator {
        b'A'..=b'Z' => Some(TransportMethod::Relay),
        b'a'..=b'z' => Some(TransportMethod::CloudBroker),
        b'2' => Some(TransportMethod::Manual),
        _ => None,
    }
}

/// Two checksum symbols: SHA-256 of the body, first 16 bits reduced mod 55².
fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(body);
    let value = u32::from(u16::from_be_bytes([digest[0], digest[1]])) % (BASE * BASE);
    [
        ALPHABET[(value / BASE) as usize],
        ALPHABET[(value % BASE) as usize],
    ]
}

/// Generate a fresh PIN for the given transport.
pub fn generate_pin(method: TransportMethod) -> Pin {
    let mut rng = rand::thread_rng();
    let candidates: Vec<u8> = match method {
        TransportMethod::Relay => ALPHABET.iter().copied().filter(u8::is_ascii_uppercase).collect(),
        TransportMethod::CloudBroker => {
            ALPHABET.iter().copied().filter(u8::is_ascii_lowercase).collect()
        }
        TransportMethod::Manual => vec![b'2'],
    };

    let mut body = Vec::with_capacity(PIN_LEN);
    body.push(candidates[rng.gen_range(0..candidates.len())]);
    for _ in 0..ENTROPY_LEN {
        body.push(ALPHABET[rng.gen_range(0..ALPHABET.len())]);
    }
    let sum = checksum(&body);
    body.extend_from_slice(&sum);

    // Every byte comes from ALPHABET, which is ASCII.
    let text = String::from_utf8(body).unwrap_or_default();
    Pin {
        text,
        method,
        expires_at: None,
    }
}

/// Returns true when `text` is a structurally valid PIN with a matching checksum.
pub fn validate_pin(text: &str) -> bool {
    Pin::parse(text).is_ok()
}

/// Spell a PIN as space-separated words for reading aloud.
pub fn pin_to_words(pin: &Pin) -> String {
    pin.expose()
        .bytes()
        .filter_map(symbol_index)
        .map(|i| WORDS[i])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a spoken/typed word sequence back into a validated PIN.
///
/// Words may be separated by spaces or hyphens and are matched case-insensitively.
pub fn words_to_pin(words: &str) -> SsResult<Pin> {
    let mut text = String::with_capacity(PIN_LEN);
    for word in words
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_ascii_lowercase();
        let idx = WORDS
            .iter()
            .position(|w| *w == lower)
            .ok_or_else(|| SsError::InvalidPin(format!("unknown word '{word}'")))?;
        text.push(char::from(ALPHABET[idx]));
    }
    Pin::parse(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_pins_validate() {
        for method in [
            TransportMethod::Relay,
            TransportMethod::CloudBroker,
            TransportMethod::Manual,
        ] {
            for _ in 0..200 {
                let pin = generate_pin(method);
                assert_eq!(pin.expose().len(), PIN_LEN);
                assert!(validate_pin(pin.expose()), "{method} PIN must validate");
                assert_eq!(Pin::parse(pin.expose()).unwrap().method(), method);
            }
        }
    }

    #[test]
    fn method_indicator() {
        assert!(generate_pin(TransportMethod::Relay).expose().as_bytes()[0].is_ascii_uppercase());
        assert!(generate_pin(TransportMethod::CloudBroker).expose().as_bytes()[0].is_ascii_lowercase());
        assert!(generate_pin(TransportMethod::Manual).expose().starts_with('2'));
    }

    #[test]
    fn rejects_structural_errors() {
        let pin = generate_pin(TransportMethod::Relay);
        let text = pin.expose();
        assert!(!validate_pin(&text[..11]));
        assert!(!validate_pin(&format!("{text}2")));
        assert!(!validate_pin(""));
        // 'O' and '0' are outside the alphabet
        assert!(!validate_pin(&format!("O{}", &text[1..])));
        assert!(!validate_pin(&format!("{}0", &text[..11])));
        assert!(matches!(Pin::parse("short"), Err(SsError::InvalidPin(_))));
    }

    #[test]
    fn digit_other_than_two_is_not_an_indicator() {
        // Recompute a correct checksum so only the indicator is wrong.
        let mut body = b"3ABCDEFGHJ".to_vec();
        let sum = checksum(&body);
        body.extend_from_slice(&sum);
        let text = String::from_utf8(body).unwrap();
        assert!(!validate_pin(&text));
    }

    #[test]
    fn single_character_mutations_are_caught() {
        let mut caught = 0usize;
        let mut total = 0usize;
        for _ in 0..50 {
            let pin = generate_pin(TransportMethod::Relay);
            let original = pin.expose().as_bytes().to_vec();
            for pos in 0..PIN_LEN {
                for &sym in ALPHABET.iter() {
                    if sym == original[pos] {
                        continue;
                    }
                    let mut mutated = original.clone();
                    mutated[pos] = sym;
                    total += 1;
                    if !validate_pin(std::str::from_utf8(&mutated).unwrap()) {
                        caught += 1;
                    }
                }
            }
        }
        let rate = caught as f64 / total as f64;
        assert!(rate > 0.99, "detection rate {rate}");
    }

    #[test]
    fn words_roundtrip_exact() {
        let pin = generate_pin(TransportMethod::CloudBroker);
        let words = pin_to_words(&pin);
        assert_eq!(words.split(' ').count(), PIN_LEN);
        let back = words_to_pin(&words).unwrap();
        assert_eq!(back, pin);
    }

    #[test]
    fn words_accept_hyphens_and_case() {
        let pin = generate_pin(TransportMethod::Manual);
        let words = pin_to_words(&pin).to_uppercase().replace(' ', "-");
        assert_eq!(words_to_pin(&words).unwrap(), pin);
    }

    #[test]
    fn unknown_word_is_invalid_pin() {
        assert!(matches!(
            words_to_pin("amber notaword"),
            Err(SsError::InvalidPin(_))
        ));
    }

    #[test]
    fn word_list_is_a_bijection() {
        let mut sorted = WORDS.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ALPHABET.len());
    }

    #[test]
    fn ttl_and_redaction() {
        let pin = generate_pin(TransportMethod::Relay).with_ttl(Duration::from_secs(60));
        let at = pin.expires_at().unwrap();
        assert!(!pin.is_expired(at));
        assert!(pin.is_expired(at + 1));
        assert!(!format!("{pin:?}").contains(pin.expose()));
    }

    proptest! {
        #[test]
        fn words_roundtrip_any_symbols(indices in proptest::collection::vec(0usize..55, 9)) {
            let mut body = vec![b'2'];
            body.extend(indices.iter().map(|&i| ALPHABET[i]));
            let sum = checksum(&body);
            body.extend_from_slice(&sum);
            let pin = Pin::parse(std::str::from_utf8(&body).unwrap()).unwrap();
            prop_assert_eq!(words_to_pin(&pin_to_words(&pin)).unwrap(), pin);
        }
    }
}
