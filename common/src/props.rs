// Copyright 2023 Oxide Computer Company
//! Named, typed property lists.
//!
//! A `PropList` is an ordered tree of named values (u64, string, nested
//! list, array of lists) used to describe pool and vdev configuration.
//! On disk it is packed as self-describing JSON so that old software
//! skips keys it does not recognize.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::PoolError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropList(Map<String, Value>);

impl PropList {
    pub fn new() -> Self {
        PropList(Map::new())
    }

    pub fn add_u64(&mut self, name: &str, value: u64) {
        self.0.insert(name.to_string(), Value::from(value));
    }

    pub fn add_str(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_string(), Value::from(value));
    }

    pub fn add_list(&mut self, name: &str, value: PropList) {
        self.0.insert(name.to_string(), Value::Object(value.0));
    }

    pub fn add_list_array(&mut self, name: &str, values: Vec<PropList>) {
        self.0.insert(
            name.to_string(),
            Value::Array(values.into_iter().map(|p| Value::Object(p.0)).collect()),
        );
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.0.get(name)?.as_u64()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name)?.as_str()
    }

    pub fn get_list(&self, name: &str) -> Option<PropList> {
        match self.0.get(name) {
            Some(Value::Object(m)) => Some(PropList(m.clone())),
            _ => None,
        }
    }

    pub fn get_list_array(&self, name: &str) -> Option<Vec<PropList>> {
        match self.0.get(name) {
            Some(Value::Array(vs)) => vs
                .iter()
                .map(|v| match v {
                    Value::Object(m) => Some(PropList(m.clone())),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Pack into at most `limit` bytes. Packing is the only fallible step
    /// in label generation: a tree that does not fit the region is
    /// `NameTooLong`, anything the serializer rejects is `InvalidArgument`.
    pub fn pack(&self, limit: usize) -> Result<Vec<u8>, PoolError> {
        let buf = serde_json::to_vec(self)
            .map_err(|e| PoolError::InvalidArgument(e.to_string()))?;
        if buf.len() > limit {
            return Err(PoolError::NameTooLong);
        }
        Ok(buf)
    }

    /// Unpack from a region image. The packed form never contains NUL
    /// bytes, so trailing zero padding is stripped before decoding.
    pub fn unpack(bytes: &[u8]) -> Result<Self, PoolError> {
        let end = match bytes.iter().rposition(|&b| b != 0) {
            Some(p) => p + 1,
            None => 0,
        };
        serde_json::from_slice(&bytes[..end])
            .map_err(|e| PoolError::InvalidArgument(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_strategy::proptest;

    fn sample() -> PropList {
        let mut child = PropList::new();
        child.add_str("type", "disk");
        child.add_u64("guid", 100);

        let mut tree = PropList::new();
        tree.add_str("type", "mirror");
        tree.add_u64("guid", 300);
        tree.add_list_array("children", vec![child.clone(), child]);

        let mut nv = PropList::new();
        nv.add_u64("version", 10);
        nv.add_str("name", "tank");
        nv.add_list("vdev_tree", tree);
        nv
    }

    #[test]
    fn roundtrip() {
        let nv = sample();
        let buf = nv.pack(4096).unwrap();
        let back = PropList::unpack(&buf).unwrap();
        assert_eq!(nv, back);
        assert_eq!(back.get_u64("version"), Some(10));
        assert_eq!(back.get_str("name"), Some("tank"));

        let tree = back.get_list("vdev_tree").unwrap();
        let children = tree.get_list_array("children").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get_u64("guid"), Some(100));
    }

    #[test]
    fn roundtrip_with_padding() {
        let nv = sample();
        let buf = nv.pack(4096).unwrap();
        let mut region = vec![0u8; 4096];
        region[..buf.len()].copy_from_slice(&buf);
        assert_eq!(PropList::unpack(&region).unwrap(), nv);
    }

    #[test]
    fn unknown_keys_ride_through() {
        let raw = br#"{"version":10,"some_future_key":{"a":1},"name":"tank"}"#;
        let nv = PropList::unpack(raw).unwrap();
        assert_eq!(nv.get_u64("version"), Some(10));
        assert!(nv.contains("some_future_key"));

        // Repacking keeps the unknown key for the next reader.
        let buf = nv.pack(4096).unwrap();
        assert!(PropList::unpack(&buf).unwrap().contains("some_future_key"));
    }

    #[test]
    fn pack_out_of_room() {
        let nv = sample();
        assert_eq!(nv.pack(8), Err(PoolError::NameTooLong));
    }

    #[test]
    fn unpack_garbage() {
        assert!(PropList::unpack(&[0xff, 0x3c, 0x00, 0x19]).is_err());
        assert!(PropList::unpack(&[0u8; 128]).is_err());
        assert!(PropList::unpack(&[]).is_err());
    }

    #[proptest]
    fn packing_roundtrips_any_u64_map(
        #[strategy(proptest::collection::btree_map("[a-z_]{1,12}", 0u64.., 0..16))]
        entries: std::collections::BTreeMap<String, u64>,
    ) {
        let mut nv = PropList::new();
        for (name, value) in &entries {
            nv.add_u64(name, *value);
        }
        let buf = nv.pack(64 * 1024).unwrap();
        let back = PropList::unpack(&buf).unwrap();
        for (name, value) in &entries {
            assert_eq!(back.get_u64(name), Some(*value));
        }
    }

    #[test]
    fn missing_and_mistyped_lookups() {
        let nv = sample();
        assert_eq!(nv.get_u64("nonesuch"), None);
        assert_eq!(nv.get_u64("name"), None);
        assert_eq!(nv.get_str("version"), None);
        assert_eq!(nv.get_list("name"), None);
        assert_eq!(nv.get_list_array("vdev_tree"), None);
    }
}
