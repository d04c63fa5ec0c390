/// Base64 helpers for binary fields that travel inside JSON documents
/// (connection IVs, stored packet payloads). Usable as a serde `with` module.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::base64::encode(data)
    }

    #[inline]
    pub fn decode(encoded: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(encoded)
    }

    #[inline]
    pub fn serialize<T, S>(data: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&encode(data.as_ref()))
    }

    #[inline]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = <&str>::deserialize(deserializer)?;
        decode(encoded).map_err(de::Error::custom)
    }
}

/// Lowercase hex rendering, the digest notation used by the wire MAC.
pub mod hex {
    #[inline]
    pub fn encode(data: &[u8]) -> String {
        ::hex::encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let data = [0u8, 1, 2, 254, 255];
        assert_eq!(base64::decode(&base64::encode(&data)).unwrap(), &data[..]);
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex::encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }
}
