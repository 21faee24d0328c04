//! Subnet topology: which network a request belongs to.
//!
//! A [`Topology`] is an immutable snapshot of every configured
//! [`Subnet`], indexed by CIDR and by relay address. Requests resolve
//! against one snapshot for their whole lifetime; configuration reloads
//! build a fresh snapshot and publish it through a [`TopologyHandle`],
//! never touching a live one.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::cidr::{AddressRange, InetCidr};
use crate::error::{Error, Result};
use crate::filter::RequestFilter;
use crate::store::PoolId;

/// Default lease duration handed to clients: 1 hour.
pub const DEFAULT_LEASE_TIME_SECS: u32 = 3600;

/// A DHCP option to apply to outbound replies.
///
/// When `mirror` is set the configured `value` is ignored and the
/// client's own value for `code` is echoed back instead (and nothing is
/// applied if the client did not send one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub code: u8,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub mirror: bool,
}

/// One configured network.
///
/// Owns a CIDR, the relay addresses that route to it, its lease pools,
/// the options applied to replies, optional static hardware-address
/// bindings, and an admission filter. Built at configuration load and
/// replaced wholesale on reload.
#[derive(Debug, Clone)]
pub struct Subnet {
    cidr: InetCidr,
    giaddrs: Vec<Ipv4Addr>,
    ranges: Vec<AddressRange>,
    options: Vec<OptionEntry>,
    static_bindings: HashMap<Vec<u8>, Ipv4Addr>,
    filter: RequestFilter,
    lease_time_secs: u32,
}

impl Subnet {
    pub fn new(cidr: InetCidr) -> Self {
        Self {
            cidr,
            giaddrs: Vec::new(),
            ranges: Vec::new(),
            options: Vec::new(),
            static_bindings: HashMap::new(),
            filter: RequestFilter::AlwaysAccept,
            lease_time_secs: DEFAULT_LEASE_TIME_SECS,
        }
    }

    pub fn with_giaddr(mut self, giaddr: Ipv4Addr) -> Self {
        self.giaddrs.push(giaddr);
        self
    }

    /// Adds a lease pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the range is not fully
    /// contained in the subnet's CIDR.
    pub fn with_range(mut self, range: AddressRange) -> Result<Self> {
        if !self.cidr.contains(range.start()) || !self.cidr.contains(range.end()) {
            return Err(Error::InvalidConfig(format!(
                "range {} is not contained in subnet {}",
                range, self.cidr
            )));
        }
        self.ranges.push(range);
        Ok(self)
    }

    pub fn with_option(mut self, option: OptionEntry) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_static_binding(mut self, hardware: Vec<u8>, address: Ipv4Addr) -> Self {
        self.static_bindings.insert(hardware, address);
        self
    }

    pub fn with_filter(mut self, filter: RequestFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_lease_time(mut self, secs: u32) -> Self {
        self.lease_time_secs = secs;
        self
    }

    pub fn cidr(&self) -> InetCidr {
        self.cidr
    }

    pub fn giaddrs(&self) -> &[Ipv4Addr] {
        &self.giaddrs
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn options(&self) -> &[OptionEntry] {
        &self.options
    }

    pub fn filter(&self) -> &RequestFilter {
        &self.filter
    }

    pub fn lease_time_secs(&self) -> u32 {
        self.lease_time_secs
    }

    /// The static address bound to `hardware`, if any.
    pub fn static_binding(&self, hardware: &[u8]) -> Option<Ipv4Addr> {
        self.static_bindings.get(hardware).copied()
    }

    /// Store identifier for the pool at `index` in this subnet.
    pub fn pool_id(&self, index: usize) -> PoolId {
        PoolId::new(format!("{}#{}", self.cidr, index))
    }

    /// True if `address` falls inside any of this subnet's pools.
    pub fn in_any_pool(&self, address: Ipv4Addr) -> bool {
        self.ranges.iter().any(|range| range.contains(address))
    }
}

/// An immutable snapshot of the whole configured topology.
#[derive(Debug, Default)]
pub struct Topology {
    by_cidr: HashMap<InetCidr, Arc<Subnet>>,
    by_giaddr: HashMap<Ipv4Addr, Arc<Subnet>>,
    lowest_prefix: u8,
    highest_prefix: u8,
    global_filter: RequestFilter,
    pre_options: Vec<OptionEntry>,
    post_options: Vec<OptionEntry>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Resolves the subnet serving `giaddr`.
    ///
    /// Tries the exact relay index first, then scans prefix lengths
    /// from the most specific configured down to the least, so the
    /// longest matching CIDR wins. `None` means the request has no
    /// configured home and must be dropped without a reply.
    ///
    /// An all-zeros `giaddr` never resolves here; the caller
    /// substitutes the receiving interface address for direct requests.
    pub fn resolve(&self, giaddr: Ipv4Addr) -> Option<Arc<Subnet>> {
        if giaddr.is_unspecified() {
            return None;
        }
        if let Some(subnet) = self.by_giaddr.get(&giaddr) {
            return Some(Arc::clone(subnet));
        }
        for prefix in (self.lowest_prefix..=self.highest_prefix).rev() {
            let candidate = InetCidr::new(giaddr, prefix).ok()?;
            if let Some(subnet) = self.by_cidr.get(&candidate) {
                return Some(Arc::clone(subnet));
            }
        }
        None
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Arc<Subnet>> {
        self.by_cidr.values()
    }

    pub fn global_filter(&self) -> &RequestFilter {
        &self.global_filter
    }

    pub fn pre_options(&self) -> &[OptionEntry] {
        &self.pre_options
    }

    pub fn post_options(&self) -> &[OptionEntry] {
        &self.post_options
    }
}

/// Accumulates subnets into a consistent [`Topology`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    by_cidr: HashMap<InetCidr, Arc<Subnet>>,
    by_giaddr: HashMap<Ipv4Addr, Arc<Subnet>>,
    lowest_prefix: u8,
    highest_prefix: u8,
    global_filter: RequestFilter,
    pre_options: Vec<OptionEntry>,
    post_options: Vec<OptionEntry>,
}

impl TopologyBuilder {
    /// Registers a subnet under its CIDR and every trigger giaddr.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigConflict`] if a giaddr is already claimed by
    /// another subnet; [`Error::InvalidConfig`] for a duplicate CIDR.
    pub fn add_subnet(&mut self, subnet: Subnet) -> Result<()> {
        let cidr = subnet.cidr();
        if self.by_cidr.contains_key(&cidr) {
            return Err(Error::InvalidConfig(format!(
                "subnet {} is configured twice",
                cidr
            )));
        }
        for &giaddr in subnet.giaddrs() {
            if self.by_giaddr.contains_key(&giaddr) {
                return Err(Error::ConfigConflict(giaddr));
            }
        }

        let subnet = Arc::new(subnet);
        for &giaddr in subnet.giaddrs() {
            self.by_giaddr.insert(giaddr, Arc::clone(&subnet));
        }
        if self.by_cidr.is_empty() {
            self.lowest_prefix = cidr.prefix();
            self.highest_prefix = cidr.prefix();
        } else {
            self.lowest_prefix = self.lowest_prefix.min(cidr.prefix());
            self.highest_prefix = self.highest_prefix.max(cidr.prefix());
        }
        self.by_cidr.insert(cidr, subnet);
        Ok(())
    }

    pub fn global_filter(&mut self, filter: RequestFilter) -> &mut Self {
        self.global_filter = filter;
        self
    }

    /// Options applied to every reply before subnet options.
    pub fn pre_options(&mut self, options: Vec<OptionEntry>) -> &mut Self {
        self.pre_options = options;
        self
    }

    /// Options applied to every reply after subnet options.
    pub fn post_options(&mut self, options: Vec<OptionEntry>) -> &mut Self {
        self.post_options = options;
        self
    }

    pub fn build(self) -> Topology {
        Topology {
            by_cidr: self.by_cidr,
            by_giaddr: self.by_giaddr,
            lowest_prefix: self.lowest_prefix,
            highest_prefix: self.highest_prefix,
            global_filter: self.global_filter,
            pre_options: self.pre_options,
            post_options: self.post_options,
        }
    }
}

/// Shared handle through which topology snapshots are published.
///
/// Readers take a cheap `Arc` clone of the current snapshot and keep
/// using it for the duration of a request; [`publish`](Self::publish)
/// swaps the reference without disturbing them. A reload that fails
/// before `publish` leaves the previous snapshot active.
#[derive(Debug, Clone, Default)]
pub struct TopologyHandle {
    current: Arc<RwLock<Arc<Topology>>>,
}

impl TopologyHandle {
    pub fn new(topology: Topology) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(topology))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Topology> {
        // Lock poisoning would mean a panic while *swapping an Arc*,
        // which cannot happen; recover the value either way.
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically replaces the active snapshot.
    pub fn publish(&self, topology: Topology) {
        let next = Arc::new(topology);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(addr: [u8; 4], prefix: u8) -> Subnet {
        Subnet::new(InetCidr::new(Ipv4Addr::from(addr), prefix).unwrap())
    }

    #[test]
    fn test_resolve_by_exact_giaddr() {
        let relay = Ipv4Addr::new(192, 168, 1, 1);
        let mut builder = Topology::builder();
        builder
            .add_subnet(subnet([192, 168, 1, 0], 24).with_giaddr(relay))
            .unwrap();
        let topology = builder.build();

        let found = topology.resolve(relay).unwrap();
        assert_eq!(found.cidr().prefix(), 24);
    }

    #[test]
    fn test_resolve_longest_prefix_wins() {
        let mut builder = Topology::builder();
        builder.add_subnet(subnet([10, 1, 0, 0], 16)).unwrap();
        builder.add_subnet(subnet([10, 1, 2, 0], 24)).unwrap();
        let topology = builder.build();

        let giaddr = Ipv4Addr::new(10, 1, 2, 40);
        let found = topology.resolve(giaddr).unwrap();
        assert_eq!(found.cidr().prefix(), 24);

        // An address only the /16 covers falls through to it.
        let giaddr = Ipv4Addr::new(10, 1, 3, 40);
        let found = topology.resolve(giaddr).unwrap();
        assert_eq!(found.cidr().prefix(), 16);
    }

    #[test]
    fn test_resolve_unknown_giaddr() {
        let mut builder = Topology::builder();
        builder.add_subnet(subnet([10, 1, 0, 0], 16)).unwrap();
        let topology = builder.build();

        assert!(topology.resolve(Ipv4Addr::new(172, 16, 0, 1)).is_none());
    }

    #[test]
    fn test_resolve_zero_giaddr_never_matches() {
        let mut builder = Topology::builder();
        builder.add_subnet(subnet([0, 0, 0, 0], 1)).unwrap();
        let topology = builder.build();

        assert!(topology.resolve(Ipv4Addr::UNSPECIFIED).is_none());
    }

    #[test]
    fn test_duplicate_giaddr_conflicts() {
        let relay = Ipv4Addr::new(192, 168, 1, 1);
        let mut builder = Topology::builder();
        builder
            .add_subnet(subnet([192, 168, 1, 0], 24).with_giaddr(relay))
            .unwrap();
        let result = builder.add_subnet(subnet([192, 168, 2, 0], 24).with_giaddr(relay));
        assert!(matches!(result, Err(Error::ConfigConflict(addr)) if addr == relay));
    }

    #[test]
    fn test_duplicate_cidr_rejected() {
        let mut builder = Topology::builder();
        builder.add_subnet(subnet([192, 168, 1, 0], 24)).unwrap();
        assert!(builder.add_subnet(subnet([192, 168, 1, 0], 24)).is_err());
    }

    #[test]
    fn test_range_must_fit_subnet() {
        let range = AddressRange::new(
            Ipv4Addr::new(192, 168, 2, 10),
            Ipv4Addr::new(192, 168, 2, 20),
        )
        .unwrap();
        assert!(subnet([192, 168, 1, 0], 24).with_range(range).is_err());
    }

    #[test]
    fn test_static_binding_lookup() {
        let hardware = vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let bound = Ipv4Addr::new(192, 168, 1, 5);
        let s = subnet([192, 168, 1, 0], 24).with_static_binding(hardware.clone(), bound);

        assert_eq!(s.static_binding(&hardware), Some(bound));
        assert_eq!(s.static_binding(&[1, 2, 3]), None);
    }

    #[test]
    fn test_handle_publish_swaps_snapshot() {
        let mut builder = Topology::builder();
        builder.add_subnet(subnet([10, 0, 0, 0], 8)).unwrap();
        let handle = TopologyHandle::new(builder.build());

        let before = handle.snapshot();
        assert!(before.resolve(Ipv4Addr::new(10, 9, 9, 9)).is_some());

        let mut builder = Topology::builder();
        builder.add_subnet(subnet([172, 16, 0, 0], 12)).unwrap();
        handle.publish(builder.build());

        // The old snapshot is still usable by whoever holds it.
        assert!(before.resolve(Ipv4Addr::new(10, 9, 9, 9)).is_some());
        let after = handle.snapshot();
        assert!(after.resolve(Ipv4Addr::new(10, 9, 9, 9)).is_none());
        assert!(after.resolve(Ipv4Addr::new(172, 16, 5, 5)).is_some());
    }
}
