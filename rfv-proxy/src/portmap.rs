//! Bidirectional map between datapath ports and the virtual switch ports
//! that face the VMs.

use std::collections::HashMap;

use rfv_proto::DpId;

/// A `(switch, port)` pair.
pub type PortKey = (DpId, u32);

/// Forward and reverse maps are kept consistent: every entry in one has its
/// mirror in the other.
#[derive(Debug, Default)]
pub struct PortMap {
    dp_to_vs: HashMap<PortKey, PortKey>,
    vs_to_dp: HashMap<PortKey, PortKey>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs a datapath port with a virtual switch port, dropping whatever
    /// either side was paired with before.
    pub fn insert(&mut self, dp: PortKey, vs: PortKey) {
        if let Some(old_vs) = self.dp_to_vs.remove(&dp) {
            self.vs_to_dp.remove(&old_vs);
        }
        if let Some(old_dp) = self.vs_to_dp.remove(&vs) {
            self.dp_to_vs.remove(&old_dp);
        }
        self.dp_to_vs.insert(dp, vs);
        self.vs_to_dp.insert(vs, dp);
    }

    /// Virtual switch port paired with a datapath port.
    pub fn lookup_dp(&self, dp: PortKey) -> Option<PortKey> {
        self.dp_to_vs.get(&dp).copied()
    }

    /// Datapath port paired with a virtual switch port.
    pub fn lookup_vs(&self, vs: PortKey) -> Option<PortKey> {
        self.vs_to_dp.get(&vs).copied()
    }

    /// Removes the pairing of one port, whichever side it is on. Returns
    /// the port it was paired with.
    pub fn remove_port(&mut self, port: PortKey) -> Option<PortKey> {
        if let Some(vs) = self.dp_to_vs.remove(&port) {
            self.vs_to_dp.remove(&vs);
            return Some(vs);
        }
        let dp = self.vs_to_dp.remove(&port)?;
        self.dp_to_vs.remove(&dp);
        Some(dp)
    }

    /// Removes every pairing a switch takes part in, on either side.
    pub fn remove_switch(&mut self, id: DpId) -> usize {
        let before = self.dp_to_vs.len();
        self.dp_to_vs.retain(|dp, vs| dp.0 != id && vs.0 != id);
        self.vs_to_dp.retain(|vs, dp| dp.0 != id && vs.0 != id);
        before - self.dp_to_vs.len()
    }

    pub fn len(&self) -> usize {
        self.dp_to_vs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dp_to_vs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut map = PortMap::new();
        map.insert((0x99, 1), (0x7a, 5));
        assert_eq!(map.lookup_dp((0x99, 1)), Some((0x7a, 5)));
        assert_eq!(map.lookup_vs((0x7a, 5)), Some((0x99, 1)));
        assert_eq!(map.lookup_dp((0x99, 2)), None);
    }

    #[test]
    fn test_insert_replaces_stale_pairs() {
        let mut map = PortMap::new();
        map.insert((0x99, 1), (0x7a, 5));

        // Same datapath port, new virtual port.
        map.insert((0x99, 1), (0x7a, 6));
        assert_eq!(map.lookup_vs((0x7a, 5)), None);
        assert_eq!(map.lookup_vs((0x7a, 6)), Some((0x99, 1)));

        // Same virtual port, new datapath port.
        map.insert((0x98, 3), (0x7a, 6));
        assert_eq!(map.lookup_dp((0x99, 1)), None);
        assert_eq!(map.lookup_vs((0x7a, 6)), Some((0x98, 3)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_switch() {
        let mut map = PortMap::new();
        map.insert((0x99, 1), (0x7a, 5));
        map.insert((0x99, 2), (0x7a, 6));
        map.insert((0x98, 1), (0x7a, 7));

        assert_eq!(map.remove_switch(0x99), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup_vs((0x7a, 5)), None);

        assert_eq!(map.remove_switch(0x7a), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_port() {
        let mut map = PortMap::new();
        map.insert((0x99, 1), (0x7a, 5));
        map.insert((0x99, 2), (0x7a, 6));

        assert_eq!(map.remove_port((0x99, 1)), Some((0x7a, 5)));
        assert_eq!(map.lookup_vs((0x7a, 5)), None);
        assert_eq!(map.remove_port((0x99, 1)), None);

        assert_eq!(map.remove_port((0x7a, 6)), Some((0x99, 2)));
        assert!(map.is_empty());
    }
}
