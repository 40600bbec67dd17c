// ABOUTME: GSM 03.38 default alphabet conversion and small text helpers
// ABOUTME: Used by the SMPP driver for payload re-encoding and by pattern expansion

/// GSM 03.38 default alphabet to ISO-8859-1. Positions that have no
/// Latin-1 counterpart (the Greek block) become `?`. 0x1B marks the
/// escape to the extension table and is handled separately.
const GSM_TO_LATIN1: [u8; 128] = [
    b'@', 0xA3, b'$', 0xA5, 0xE8, 0xE9, 0xF9, 0xEC, // 0x00
    0xF2, 0xC7, b'\n', 0xD8, 0xF8, b'\r', 0xC5, 0xE5, // 0x08
    b'?', b'_', b'?', b'?', b'?', b'?', b'?', b'?', // 0x10 Greek
    b'?', b'?', b'?', 0x1B, 0xC6, 0xE6, 0xDF, 0xC9, // 0x18
    b' ', b'!', b'"', b'#', 0xA4, b'%', b'&', b'\'', // 0x20
    b'(', b')', b'*', b'+', b',', b'-', b'.', b'/', // 0x28
    b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', // 0x30
    b'8', b'9', b':', b';', b'<', b'=', b'>', b'?', // 0x38
    0xA1, b'A', b'B', b'C', b'D', b'E', b'F', b'G', // 0x40
    b'H', b'I', b'J', b'K', b'L', b'M', b'N', b'O', // 0x48
    b'P', b'Q', b'R', b'S', b'T', b'U', b'V', b'W', // 0x50
    b'X', b'Y', b'Z', 0xC4, 0xD6, 0xD1, 0xDC, 0xA7, // 0x58
    0xBF, b'a', b'b', b'c', b'd', b'e', b'f', b'g', // 0x60
    b'h', b'i', b'j', b'k', b'l', b'm', b'n', b'o', // 0x68
    b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', // 0x70
    b'x', b'y', b'z', 0xE4, 0xF6, 0xF1, 0xFC, 0xE0, // 0x78
];

/// Extension table entries reachable via 0x1B that map into Latin-1.
const GSM_EXT_TO_LATIN1: &[(u8, u8)] = &[
    (0x14, b'^'),
    (0x28, b'{'),
    (0x29, b'}'),
    (0x2F, b'\\'),
    (0x3C, b'['),
    (0x3D, b'~'),
    (0x3E, b']'),
    (0x40, b'|'),
];

/// Convert a GSM 03.38 encoded buffer to ISO-8859-1 in place.
pub fn gsm_to_latin1(data: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied().peekable();
    while let Some(b) = iter.next() {
        let b = b & 0x7F;
        if b == 0x1B {
            match iter.next() {
                Some(ext) => {
                    let ext = ext & 0x7F;
                    match GSM_EXT_TO_LATIN1.iter().find(|(g, _)| *g == ext) {
                        Some((_, l)) => out.push(*l),
                        // per 03.38, unknown escape renders the base character
                        None => out.push(GSM_TO_LATIN1[ext as usize]),
                    }
                }
                None => out.push(b' '),
            }
        } else {
            out.push(GSM_TO_LATIN1[b as usize]);
        }
    }
    *data = out;
}

/// Convert an ISO-8859-1 buffer to GSM 03.38 in place. Characters with
/// no GSM counterpart become `?` (0x3F).
pub fn latin1_to_gsm(data: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(data.len());
    for &c in data.iter() {
        if let Some(pos) = GSM_TO_LATIN1
            .iter()
            .position(|&l| l == c && l != b'?' && l != 0x1B)
        {
            out.push(pos as u8);
        } else if c == b'?' {
            out.push(0x3F);
        } else if let Some((g, _)) = GSM_EXT_TO_LATIN1.iter().find(|(_, l)| *l == c) {
            out.push(0x1B);
            out.push(*g);
        } else {
            out.push(0x3F);
        }
    }
    *data = out;
}

/// Widen an 8-bit (Latin-1 compatible) buffer into UCS-2 big-endian.
pub fn latin1_to_ucs2(data: &mut Vec<u8>) {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &c in data.iter() {
        out.push(0);
        out.push(c);
    }
    *data = out;
}

/// URL-encode arbitrary bytes: alphanumerics and `-_.~` pass through,
/// everything else becomes `%XX`.
pub fn url_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// True when `s` is non-empty and all ASCII digits.
pub fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
