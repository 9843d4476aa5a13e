use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Error, SIGNATURE_METHOD, SIGNATURE_TAG_BYTES};

/// A configured signature key: a method literal and its raw key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub method: String,
    pub material: Vec<u8>,
}

impl Key {
    /// Build a key from its wire form, a method literal and hex-encoded
    /// material. Only `SHA-256` is defined.
    pub fn parse(method: &str, hex: &str) -> Result<Self, Error> {
        if method != SIGNATURE_METHOD {
            return Err(Error::UnknownSignatureMethod(method.to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            material: decode_hex(hex)?,
        })
    }
}

/// Decode a hex string into bytes, two digits per byte.
///
/// # Test
///
/// ```
/// use house_portal_codec::crypto::decode_hex;
///
/// assert_eq!(decode_hex("4a656665").unwrap(), b"Jefe");
/// assert!(decode_hex("4a6").is_err());
/// assert!(decode_hex("zz").is_err());
/// ```
pub fn decode_hex(text: &str) -> Result<Vec<u8>, Error> {
    if text.len() % 2 != 0 || text.is_empty() {
        return Err(Error::BadHexKey(text.to_string()));
    }

    (0..text.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&text[index..index + 2], 16)
                .map_err(|_| Error::BadHexKey(text.to_string()))
        })
        .collect()
}

/// Encode bytes as lowercase hex.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Truncated HMAC-SHA256 wire tag over the given parts, in order.
///
/// # Test
///
/// The value below is the first [`SIGNATURE_TAG_BYTES`] bytes of RFC 4231
/// test case 2.
///
/// ```
/// use house_portal_codec::crypto::signature_tag;
///
/// let tag = signature_tag(b"Jefe", &[b"what do ya want for nothing?"]);
///
/// assert_eq!(tag, "5bdcc146");
/// ```
pub fn signature_tag(key: &[u8], parts: &[&[u8]]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");

    for part in parts {
        mac.update(part);
    }

    let output = mac.finalize().into_bytes();
    encode_hex(&output[..SIGNATURE_TAG_BYTES])
}

/// The tag of a datagram payload (the line with the suffix stripped). The
/// wire protocol signs the payload with a trailing NUL included.
pub fn payload_tag(key: &Key, payload: &str) -> String {
    signature_tag(&key.material, &[payload.as_bytes(), b"\0"])
}

/// Append a signature suffix to a payload.
///
/// # Test
///
/// ```
/// use house_portal_codec::{
///     crypto::{Key, sign},
///     message::verify,
/// };
///
/// let key = Key::parse("SHA-256", "4a656665").unwrap();
/// let line = sign("PEER 1700000000 attic", &key);
///
/// assert_eq!(verify(&line, std::slice::from_ref(&key)).unwrap(), "PEER 1700000000 attic");
/// ```
pub fn sign(payload: &str, key: &Key) -> String {
    format!("{} {} {}", payload, key.method, payload_tag(key, payload))
}
