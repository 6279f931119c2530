//! Cryptographic functions for LE legacy pairing
//!
//! Every 128-bit value here is a little-endian byte array, the order in which
//! it travels over the air. The AES block cipher works on big-endian blocks,
//! so [`e`] reverses its inputs and output around the cipher call.

use super::constants::SMP_MAX_PASSKEY;
use super::types::{SmpError, SmpResult};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use log::trace;
use rand::RngCore;

/// Security function e (BT Core Spec Vol 3, Part H, 2.2.1)
pub fn e(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let mut key_be = *key;
    key_be.reverse();
    let mut block = *plaintext;
    block.reverse();

    let cipher = aes::Aes128::new(GenericArray::from_slice(&key_be));
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));

    block.reverse();
    block
}

fn xor_128(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Confirm value generation function c1 (BT Core Spec Vol 3, Part H, 2.2.3)
///
/// `preq` and `pres` are the full 7-byte pairing request and response PDUs,
/// opcode included. `iat`/`rat` are 1 for random addresses.
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    iat: u8,
    rat: u8,
    ia: &[u8; 6],
    ra: &[u8; 6],
) -> [u8; 16] {
    // p1 = pres || preq || rat || iat
    let mut p1 = [0u8; 16];
    p1[0] = iat;
    p1[1] = rat;
    p1[2..9].copy_from_slice(preq);
    p1[9..16].copy_from_slice(pres);

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[0..6].copy_from_slice(ra);
    p2[6..12].copy_from_slice(ia);

    let inner = e(k, &xor_128(r, &p1));
    let confirm = e(k, &xor_128(&inner, &p2));

    trace!(
        "c1 k={} r={} p1={} p2={} -> {}",
        hex::encode(k),
        hex::encode(r),
        hex::encode(p1),
        hex::encode(p2),
        hex::encode(confirm)
    );
    confirm
}

/// Key generation function s1 (BT Core Spec Vol 3, Part H, 2.2.4)
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    // r' = r1' || r2', the low halves of each random
    let mut r_prime = [0u8; 16];
    r_prime[0..8].copy_from_slice(&r2[0..8]);
    r_prime[8..16].copy_from_slice(&r1[0..8]);

    let out = e(k, &r_prime);
    trace!("s1 r'={} -> {}", hex::encode(r_prime), hex::encode(out));
    out
}

/// Temporary key for a passkey, stored little-endian in the low bytes
pub fn tk_from_passkey(passkey: u32) -> SmpResult<[u8; 16]> {
    if passkey > SMP_MAX_PASSKEY {
        return Err(SmpError::InvalidParameter(format!(
            "passkey {} out of range",
            passkey
        )));
    }

    let mut tk = [0u8; 16];
    tk[0..4].copy_from_slice(&passkey.to_le_bytes());
    Ok(tk)
}

/// Compare two values without an early exit
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a 128-bit random number
pub fn generate_random_128(rng: &mut dyn RngCore) -> [u8; 16] {
    let mut out = [0u8; 16];
    rng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c1_sample_data() {
        let k = [0u8; 16];
        let r = [
            0xE0, 0x2E, 0x70, 0xC6, 0x4E, 0x27, 0x88, 0x63, 0x0E, 0x6F, 0xAD, 0x56, 0x21, 0xD5,
            0x83, 0x57,
        ];
        let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
        let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
        let ia = [0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1];
        let ra = [0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1];

        let confirm = c1(&k, &r, &preq, &pres, 1, 0, &ia, &ra);
        assert_eq!(
            confirm,
            [
                0x86, 0x3B, 0xF1, 0xBE, 0xC5, 0x4D, 0xA7, 0xD2, 0xEA, 0x88, 0x89, 0x87, 0xEF, 0x3F,
                0x1E, 0x1E
            ]
        );
    }

    #[test]
    fn test_s1_sample_data() {
        let k = [0u8; 16];
        let r1 = [
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
            0x0F, 0x00,
        ];
        let r2 = [
            0x00, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x99, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03,
            0x02, 0x01,
        ];

        assert_eq!(
            s1(&k, &r1, &r2),
            [
                0x62, 0xA0, 0x6D, 0x79, 0xAE, 0x16, 0x42, 0x5B, 0x9B, 0xF4, 0xB0, 0xE8, 0xF0, 0xE1,
                0x1F, 0x9A
            ]
        );
    }

    #[test]
    fn test_passkey_stk() {
        let tk = tk_from_passkey(884570).unwrap();
        assert_eq!(&tk[..4], &[0x5A, 0x7F, 0x0D, 0x00]);

        let randm = [
            0x4d, 0x2c, 0xf2, 0xb7, 0x11, 0x56, 0xbd, 0x4f, 0xfc, 0xde, 0xa9, 0x86, 0x4d, 0xfd,
            0x77, 0x03,
        ];
        let rands = [
            0x12, 0x45, 0x65, 0x2c, 0x85, 0x56, 0x32, 0x8f, 0xf4, 0x7f, 0x44, 0xd0, 0x17, 0x35,
            0x41, 0xed,
        ];
        assert_eq!(
            s1(&tk, &rands, &randm),
            [
                0x2b, 0x9c, 0x1e, 0x42, 0xa8, 0xcb, 0xab, 0xd1, 0x4b, 0xde, 0x50, 0x05, 0x50, 0xd9,
                0x95, 0xc6
            ]
        );
    }

    #[test]
    fn test_passkey_range() {
        assert!(tk_from_passkey(999_999).is_ok());
        assert!(matches!(
            tk_from_passkey(1_000_000),
            Err(SmpError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq(&[1, 2], &[1, 2, 3]));
    }
}
