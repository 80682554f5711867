//! Serde helpers for 32-byte key material, hex-encoded in JSON.

use serde::{Deserialize, Deserializer, Serializer};

fn decode32<E: serde::de::Error>(s: &str) -> Result<[u8; 32], E> {
    let bytes = hex::decode(s).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|_| E::custom("expected 32 bytes"))
}

pub mod hex32 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        decode32(&s)
    }
}

pub mod hex32_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 32]>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| decode32(&s)).transpose()
    }
}

pub mod hex32_vec {
    use super::*;

    pub fn serialize<S: Serializer>(
        items: &Vec<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<[u8; 32]>, D::Error> {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings.iter().map(|s| decode32(s)).collect()
    }
}

pub mod hex32_map {
    use super::*;
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(
        map: &HashMap<u32, [u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(map.iter().map(|(k, v)| (*k, hex::encode(v))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<u32, [u8; 32]>, D::Error> {
        let raw: HashMap<u32, String> = HashMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| Ok((k, decode32(&v)?)))
            .collect()
    }
}
