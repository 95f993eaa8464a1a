//! The replicated registry: a thread-safe map from address to tag.
//!
//! Each synchronisation server holds one linker and gossips it to its
//! peers. Merging is pointwise last-writer-wins keyed on the address —
//! there are no timestamps, conflicts resolve in arrival order, and because
//! entries are removed when the connection that created them dies, replicas
//! converge over any quiet interval.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::net::PeerAddress;

/// Serialised wire form: `{tag: [[host, port], …]}`.
pub type LinkerSnapshot = HashMap<String, Vec<PeerAddress>>;

#[derive(Default)]
pub struct AddressesLinker {
    // One mutex over both reads and writes; callers snapshot before I/O.
    entries: Mutex<HashMap<PeerAddress, String>>,
}

impl AddressesLinker {
    pub fn new() -> Self {
        AddressesLinker::default()
    }

    /// Insert or replace the entry for `address`.
    pub fn link(&self, address: PeerAddress, tag: impl Into<String>) {
        self.entries.lock().insert(address, tag.into());
    }

    /// Remove the entry for `address`; silent when absent.
    pub fn unlink(&self, address: &PeerAddress) {
        self.entries.lock().remove(address);
    }

    /// Pointwise overwrite with every entry of `other`.
    pub fn merge(&self, other: &AddressesLinker) {
        let incoming = other.snapshot();
        self.entries.lock().extend(incoming);
    }

    /// Copy of the full address → tag map.
    pub fn snapshot(&self) -> HashMap<PeerAddress, String> {
        self.entries.lock().clone()
    }

    /// Reverse lookup: every requested tag mapped to the (unordered)
    /// addresses that currently claim it. Requested tags always appear in
    /// the result, if only with an empty list.
    pub fn values_for<S: AsRef<str>>(&self, tags: &[S]) -> LinkerSnapshot {
        let mut linked: LinkerSnapshot = tags
            .iter()
            .map(|tag| (tag.as_ref().to_string(), Vec::new()))
            .collect();
        let entries = self.entries.lock();
        for (address, tag) in entries.iter() {
            if let Some(addresses) = linked.get_mut(tag) {
                addresses.push(address.clone());
            }
        }
        linked
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Serialise as `{tag: [[host, port], …]}`.
    pub fn to_json(&self) -> String {
        let mut grouped: LinkerSnapshot = HashMap::new();
        let entries = self.entries.lock();
        for (address, tag) in entries.iter() {
            grouped.entry(tag.clone()).or_default().push(address.clone());
        }
        drop(entries);
        serde_json::to_string(&grouped).expect("linker serialisation is infallible")
    }

    /// Deserialise the `to_json` form back into a linker.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let grouped: LinkerSnapshot = serde_json::from_str(text)?;
        let linker = AddressesLinker::new();
        {
            let mut entries = linker.entries.lock();
            for (tag, addresses) in grouped {
                for address in addresses {
                    entries.insert(address, tag.clone());
                }
            }
        }
        Ok(linker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16) -> PeerAddress {
        PeerAddress::new(host, port)
    }

    #[test]
    fn last_link_wins() {
        let linker = AddressesLinker::new();
        linker.link(addr("192.168.1.7", 51234), "channel7group0");
        linker.link(addr("192.168.1.7", 51234), "channel7group1");
        let snapshot = linker.snapshot();
        assert_eq!(
            snapshot.get(&addr("192.168.1.7", 51234)).map(String::as_str),
            Some("channel7group1")
        );
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn unlink_is_silent_on_missing() {
        let linker = AddressesLinker::new();
        linker.unlink(&addr("10.0.0.1", 1));
        assert!(linker.is_empty());
    }

    #[test]
    fn merge_overwrites_pointwise() {
        let ours = AddressesLinker::new();
        ours.link(addr("10.0.0.1", 1000), "channel1group0");
        ours.link(addr("10.0.0.2", 2000), "channel2group0");

        let theirs = AddressesLinker::new();
        theirs.link(addr("10.0.0.2", 2000), "channel9group9");
        theirs.link(addr("10.0.0.3", 3000), "channel3group0");

        ours.merge(&theirs);
        let snapshot = ours.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.get(&addr("10.0.0.2", 2000)).map(String::as_str),
            Some("channel9group9")
        );
    }

    #[test]
    fn mutual_merge_converges() {
        let a = AddressesLinker::new();
        a.link(addr("10.0.0.1", 1000), "channel1group0");
        let b = AddressesLinker::new();
        b.link(addr("10.0.0.2", 2000), "channel2group0");

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn json_round_trip() {
        let linker = AddressesLinker::new();
        linker.link(addr("192.168.1.7", 51234), "channel7group0");
        linker.link(addr("192.168.1.8", 51235), "channel7group0");
        linker.link(addr("192.168.1.9", 51236), "channel3group1");

        let restored = AddressesLinker::from_json(&linker.to_json()).unwrap();
        assert_eq!(restored.snapshot(), linker.snapshot());
    }

    #[test]
    fn values_for_lists_requested_tags_only() {
        let linker = AddressesLinker::new();
        linker.link(addr("192.168.1.7", 51234), "channel7group0");
        linker.link(addr("192.168.1.9", 51236), "channel3group1");

        let values = linker.values_for(&["channel7group0", "channel0group0"]);
        assert_eq!(values.len(), 2);
        assert_eq!(
            values.get("channel7group0").unwrap(),
            &vec![addr("192.168.1.7", 51234)]
        );
        assert!(values.get("channel0group0").unwrap().is_empty());
        assert!(!values.contains_key("channel3group1"));
    }
}
