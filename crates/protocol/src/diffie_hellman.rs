//! Diffie-Hellman over the RFC 3526 2048-bit MODP group.
//!
//! Pairing runs this exchange twice, once for the encryption key and once
//! for the signing key. The terminal sends its public value `A` as unsigned
//! hex; we answer with our `B` and hash the shared secret into an SPI key with
//! [`dh_secret_to_spi_secret`].

use std::sync::LazyLock;

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{hex_to_bytes, sha256_hex};
use crate::error::{ProtocolError, Result};

/// Generator of the MODP group.
pub const MODP_2048_G: u32 = 2;

/// Width of a normalized shared secret in hex characters (256 bytes).
pub const SECRET_HEX_WIDTH: usize = 512;

const MODP_2048_P_DECIMAL: &str = "\
    3231700607131100730033891392642382824881794124114023911284200975140074170663435422261968941736356934\
    7117901737909704191754605873209195028853758986185622153212175412514901774520270235796078236248884246\
    1894775876411059286460994117232454266225221932305409190376805242355191256797158701170010580558776510\
    3886184728025797605490356973256152616708133936179954133647655916036831789672907317838458968063967190\
    0977202194168647225871031411336429319536193471636533209717077448227988588565369208645296636077250268\
    9555059283627511211740969729980684105543595848665832916421362182310789909994486524682624169720359118\
    52507045361090559";

static MODP_2048_P: LazyLock<BigUint> = LazyLock::new(|| {
    BigUint::parse_bytes(MODP_2048_P_DECIMAL.as_bytes(), 10)
        .expect("RFC 3526 prime literal is valid decimal")
});

/// The 2048-bit MODP prime `p`.
pub fn modp_2048_prime() -> &'static BigUint {
    &MODP_2048_P
}

/// Draws a private key uniformly from `[2, p - 2]`.
///
/// Uses rejection sampling over the bit width of `p`, so every candidate in
/// range is equally likely.
pub fn random_private_key(p: &BigUint) -> BigUint {
    let two = BigUint::from(2u32);
    let upper = p - 1u32;
    let bits = p.bits();
    let byte_len = bits.div_ceil(8) as usize;
    let excess_bits = (byte_len as u64 * 8 - bits) as u32;
    let mut buf = vec![0u8; byte_len.max(1)];

    loop {
        OsRng.fill_bytes(&mut buf);
        if excess_bits > 0 {
            buf[0] &= 0xFF >> excess_bits;
        }
        let candidate = BigUint::from_bytes_be(&buf);
        if candidate >= two && candidate < upper {
            return candidate;
        }
    }
}

/// Computes `g^private mod p`.
pub fn public_key(p: &BigUint, g: &BigUint, private_key: &BigUint) -> BigUint {
    g.modpow(private_key, p)
}

/// Computes `their_public^my_private mod p`.
pub fn shared_secret(p: &BigUint, their_public: &BigUint, my_private: &BigUint) -> BigUint {
    their_public.modpow(my_private, p)
}

/// Parses a peer's public value, always treating the hex as unsigned.
///
/// Values outside `(1, p - 1)` are rejected since they confine the shared
/// secret to a trivial subgroup.
pub fn parse_public_key(hex: &str) -> Result<BigUint> {
    let value = BigUint::parse_bytes(hex.trim().as_bytes(), 16)
        .ok_or_else(|| ProtocolError::InvalidPublicKey(format!("not a hex integer: {hex:?}")))?;

    let p = modp_2048_prime();
    let one = BigUint::from(1u32);
    if value <= one || value >= p - &one {
        return Err(ProtocolError::InvalidPublicKey(
            "public value outside the valid group range".to_string(),
        ));
    }
    Ok(value)
}

/// Renders an integer as uppercase hex without leading zeros.
pub fn to_hex(value: &BigUint) -> String {
    format!("{value:X}")
}

/// Pads or trims a shared-secret hex string to exactly 512 characters.
///
/// A 513 character rendering carries one spurious leading digit which is
/// dropped; shorter renderings are left-padded with zeros.
pub fn normalize_secret_hex(hex: &str) -> String {
    if hex.len() == SECRET_HEX_WIDTH + 1 {
        hex[1..].to_string()
    } else if hex.len() < SECRET_HEX_WIDTH {
        format!("{hex:0>width$}", width = SECRET_HEX_WIDTH)
    } else {
        hex.to_string()
    }
}

/// Turns a raw shared secret into an SPI key: SHA-256 of its 256 byte
/// big-endian form, as uppercase hex.
pub fn dh_secret_to_spi_secret(secret: &BigUint) -> Result<String> {
    let normalized = normalize_secret_hex(&to_hex(secret));
    let bytes = hex_to_bytes(&normalized)?;
    Ok(sha256_hex(&bytes))
}

/// Our half of one exchange.
#[derive(Debug, Clone)]
pub struct PublicKeyAndSecret {
    /// Our public value `B`, uppercase hex.
    pub my_public_key: String,
    /// The derived SPI key, uppercase hex.
    pub shared_secret: String,
}

/// Runs one full exchange against the terminal's public value `A`.
pub fn calculate_public_key_and_secret(their_public_hex: &str) -> Result<PublicKeyAndSecret> {
    let p = modp_2048_prime();
    let g = BigUint::from(MODP_2048_G);

    let their_public = parse_public_key(their_public_hex)?;
    let my_private = random_private_key(p);
    let my_public = public_key(p, &g, &my_private);
    let secret = shared_secret(p, &their_public, &my_private);

    Ok(PublicKeyAndSecret {
        my_public_key: to_hex(&my_public),
        shared_secret: dh_secret_to_spi_secret(&secret)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prime_is_rfc3526_group_14() {
        let p = modp_2048_prime();
        assert_eq!(p.bits(), 2048);

        let hex = to_hex(p);
        assert!(hex.starts_with("FFFFFFFFFFFFFFFFC90FDAA22168C234"));
        assert!(hex.ends_with("15728E5A8AACAA68FFFFFFFFFFFFFFFF"));
    }

    #[test]
    fn test_textbook_exchange() {
        let p = BigUint::from(23u32);
        let g = BigUint::from(5u32);
        let a = BigUint::from(6u32);
        let b = BigUint::from(15u32);

        let big_a = public_key(&p, &g, &a);
        let big_b = public_key(&p, &g, &b);
        assert_eq!(big_a, BigUint::from(8u32));
        assert_eq!(big_b, BigUint::from(19u32));

        assert_eq!(shared_secret(&p, &big_b, &a), BigUint::from(2u32));
        assert_eq!(shared_secret(&p, &big_a, &b), BigUint::from(2u32));
    }

    #[test]
    fn test_random_private_key_stays_in_range() {
        let p = BigUint::from(23u32);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..2000 {
            let k = random_private_key(&p);
            assert!(k >= BigUint::from(2u32));
            assert!(k <= BigUint::from(21u32));
            seen.insert(k);
        }
        // Every value in [2, 21] is reachable.
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_random_private_key_full_group() {
        let p = modp_2048_prime();
        let k1 = random_private_key(p);
        let k2 = random_private_key(p);
        assert_ne!(k1, k2);
        assert!(&k1 < p);
    }

    #[test]
    fn test_both_sides_derive_same_spi_secret() {
        let p = modp_2048_prime();
        let g = BigUint::from(MODP_2048_G);

        let terminal_private = random_private_key(p);
        let terminal_public = public_key(p, &g, &terminal_private);

        let ours = calculate_public_key_and_secret(&to_hex(&terminal_public)).unwrap();
        let our_public = parse_public_key(&ours.my_public_key).unwrap();
        let terminal_secret = shared_secret(p, &our_public, &terminal_private);

        assert_eq!(
            ours.shared_secret,
            dh_secret_to_spi_secret(&terminal_secret).unwrap()
        );
        assert_eq!(ours.shared_secret.len(), 64);
    }

    #[test]
    fn test_parse_public_key_is_unsigned() {
        // A leading high bit must not flip the sign.
        let value = parse_public_key("FF").unwrap();
        assert_eq!(value, BigUint::from(255u32));
    }

    #[test]
    fn test_parse_public_key_rejects_degenerate_values() {
        assert!(parse_public_key("0").is_err());
        assert!(parse_public_key("1").is_err());
        assert!(parse_public_key(&to_hex(&(modp_2048_prime() - 1u32))).is_err());
        assert!(parse_public_key("not-hex").is_err());
    }

    #[test]
    fn test_normalize_pads_short_secret() {
        let short = "A".repeat(511);
        let normalized = normalize_secret_hex(&short);

        assert_eq!(normalized.len(), SECRET_HEX_WIDTH);
        assert!(normalized.starts_with("0A"));
        assert_eq!(hex_to_bytes(&normalized).unwrap().len(), 256);
    }

    #[test]
    fn test_normalize_keeps_exact_width() {
        let exact = "B".repeat(512);
        assert_eq!(normalize_secret_hex(&exact), exact);
    }

    #[test]
    fn test_normalize_strips_one_leading_digit() {
        let long = format!("0{}", "C".repeat(512));
        let normalized = normalize_secret_hex(&long);

        assert_eq!(normalized, "C".repeat(512));
        assert_eq!(hex_to_bytes(&normalized).unwrap().len(), 256);
    }

    #[test]
    fn test_small_secret_hashes_padded_form() {
        let secret = BigUint::from(0x1234u32);
        let mut padded = vec![0u8; 256];
        padded[254] = 0x12;
        padded[255] = 0x34;

        assert_eq!(
            dh_secret_to_spi_secret(&secret).unwrap(),
            sha256_hex(&padded)
        );
    }
}
