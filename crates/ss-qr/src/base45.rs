//! Base45 (RFC 9285)
//!
//! Two bytes become three symbols, a trailing byte becomes two. Every symbol
//! is in the QR alphanumeric set, which packs 5.5 bits per character.

use ss_core::{SsError, SsResult};

pub const ALPHABET: &[u8; 45] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ $%*+-./:";

pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(2) * 3);
    for pair in data.chunks(2) {
        match *pair {
            [a, b] => {
                let n = (u32::from(a) << 8) | u32::from(b);
                push_symbols(&mut out, n, 3);
            }
            [a] => push_symbols(&mut out, u32::from(a), 2),
            _ => unreachable!("chunks(2) yields one or two bytes"),
        }
    }
    out
}

fn push_symbols(out: &mut String, mut n: u32, count: usize) {
    for _ in 0..count {
        out.push(char::from(ALPHABET[(n % 45) as usize]));
        n /= 45;
    }
}

pub fn decode(text: &str) -> SsResult<Vec<u8>> {
    let symbols = text.as_bytes();
    if symbols.len() % 3 == 1 {
        return Err(SsError::malformed(format!(
            "invalid base45 length {}",
            symbols.len()
        )));
    }

    let mut out = Vec::with_capacity(symbols.len() / 3 * 2 + 1);
    for group in symbols.chunks(3) {
        let mut n = 0u32;
        for (i, &s) in group.iter().enumerate() {
            let v = value_of(s)?;
            n += v * 45u32.pow(i as u32);
        }
        if group.len() == 3 {
            if n > 0xFFFF {
                return Err(SsError::malformed("base45 group out of range"));
            }
            out.extend_from_slice(&(n as u16).to_be_bytes());
        } else {
            if n > 0xFF {
                return Err(SsError::malformed("base45 tail out of range"));
            }
            out.push(n as u8);
        }
    }
    Ok(out)
}

fn value_of(symbol: u8) -> SsResult<u32> {
    ALPHABET
        .iter()
        .position(|&s| s == symbol)
        .map(|p| p as u32)
        .ok_or_else(|| {
            SsError::malformed(format!("'{}' is not a base45 symbol", char::from(symbol)))
        })
}
