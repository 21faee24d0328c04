//! Request orchestration: one decoded request in, at most one reply out.
//!
//! The engine wires the other components together per message type:
//! global filter, topology resolution, subnet filter, then allocation
//! (DISCOVER), confirmation (REQUEST), or reclamation (RELEASE). Every
//! failure path drops the datagram silently; DHCP clients retransmit,
//! so a dropped request is always safe.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::allocator::Allocator;
use crate::cidr::AddressRange;
use crate::error::{Error, Result};
use crate::options::{MessageType, OPT_LEASE_TIME, OPT_SERVER_ID, OPT_SUBNET_MASK};
use crate::packet::{BOOTREQUEST, DhcpMessage};
use crate::store::{LeaseStatus, LeaseStore, PoolId};
use crate::topology::{OptionEntry, Subnet, Topology, TopologyHandle};

/// UDP port servers listen on.
pub const SERVER_PORT: u16 = 67;

/// UDP port clients listen on.
pub const CLIENT_PORT: u16 = 68;

/// The DHCP server core.
///
/// Owns a topology handle and an allocator; the surrounding listener
/// feeds it datagrams via [`handle_datagram`](Self::handle_datagram)
/// and sends whatever comes back to the reply's `destination`.
#[derive(Debug, Clone)]
pub struct Engine<S> {
    topology: TopologyHandle,
    allocator: Allocator<S>,
    server_id: Ipv4Addr,
}

impl<S: LeaseStore> Engine<S> {
    pub fn new(topology: TopologyHandle, allocator: Allocator<S>, server_id: Ipv4Addr) -> Self {
        Self {
            topology,
            allocator,
            server_id,
        }
    }

    pub fn topology(&self) -> &TopologyHandle {
        &self.topology
    }

    pub fn allocator(&self) -> &Allocator<S> {
        &self.allocator
    }

    /// Provisions a store pool for every range in the current topology
    /// snapshot. Call after construction and after each reload;
    /// idempotent for pools that already exist.
    pub async fn provision(&self) -> Result<()> {
        let topology = self.topology.snapshot();
        for subnet in topology.subnets() {
            for (index, &range) in subnet.ranges().iter().enumerate() {
                self.allocator.provision(&subnet.pool_id(index), range).await?;
            }
        }
        Ok(())
    }

    /// Handles one raw datagram end-to-end.
    ///
    /// `local_ip` is the address of the interface the datagram arrived
    /// on; it stands in for `giaddr` when the request was not relayed.
    /// Returns the encoded reply, or `None` when the datagram is
    /// malformed, filtered, unresolvable, or of an unhandled type.
    pub async fn handle_datagram(&self, data: &[u8], local_ip: Ipv4Addr) -> Option<Vec<u8>> {
        let request = match DhcpMessage::decode(data, 0, data.len()) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, len = data.len(), "dropping undecodable datagram");
                return None;
            }
        };

        let reply = self.handle(&request, local_ip).await?;
        match reply.encode() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                // Never send a malformed packet.
                error!(%err, xid = reply.xid, "dropping unencodable reply");
                None
            }
        }
    }

    /// Handles one decoded request, producing at most one reply.
    pub async fn handle(&self, request: &DhcpMessage, local_ip: Ipv4Addr) -> Option<DhcpMessage> {
        if request.op != BOOTREQUEST {
            trace!(op = request.op, "ignoring non-request packet");
            return None;
        }
        let message_type = match request.message_type() {
            Some(t) => t,
            None => {
                trace!("ignoring packet without a message type");
                return None;
            }
        };

        let topology = self.topology.snapshot();
        if !topology.global_filter().is_accepted(request) {
            debug!(mac = %request.format_mac(), "rejected by global filter");
            return None;
        }

        // Direct (non-relayed) requests resolve by the receiving
        // interface instead of giaddr.
        let resolve_key = if request.giaddr.is_unspecified() {
            local_ip
        } else {
            request.giaddr
        };
        let subnet = match topology.resolve(resolve_key) {
            Some(subnet) => subnet,
            None => {
                debug!(giaddr = %resolve_key, "no subnet for request, dropping");
                return None;
            }
        };
        if !subnet.filter().is_accepted(request) {
            debug!(mac = %request.format_mac(), subnet = %subnet.cidr(), "rejected by subnet filter");
            return None;
        }

        match message_type {
            MessageType::Discover => self.handle_discover(request, &topology, &subnet).await,
            MessageType::Request => self.handle_request(request, &topology, &subnet).await,
            MessageType::Release => {
                self.handle_release(request, &subnet).await;
                None
            }
            other => {
                trace!(message_type = %other, "unhandled message type");
                None
            }
        }
    }

    async fn handle_discover(
        &self,
        request: &DhcpMessage,
        topology: &Topology,
        subnet: &Subnet,
    ) -> Option<DhcpMessage> {
        let hardware = request.chaddr_bytes();
        let lease_time = self.effective_lease_time(request, subnet);

        let address = if let Some(bound) = subnet.static_binding(hardware) {
            debug!(mac = %request.format_mac(), address = %bound, "using static binding");
            bound
        } else {
            self.allocate_from(subnet, hardware, lease_time).await?.address
        };

        info!(
            mac = %request.format_mac(),
            address = %address,
            xid = request.xid,
            "offering address"
        );

        self.build_reply(request, topology, subnet, MessageType::Offer, address, lease_time)
            .map_err(|err| error!(%err, "failed to build offer"))
            .ok()
    }

    async fn handle_request(
        &self,
        request: &DhcpMessage,
        topology: &Topology,
        subnet: &Subnet,
    ) -> Option<DhcpMessage> {
        // A client committing to a different server is not ours to
        // answer.
        if let Some(server_id) = request.server_identifier() {
            if server_id != self.server_id {
                trace!(%server_id, "request addressed to another server");
                return None;
            }
        }

        let claimed = match request.requested_ip() {
            Some(address) => address,
            // RENEWING/REBINDING clients put the address in ciaddr.
            None if !request.ciaddr.is_unspecified() => request.ciaddr,
            None => {
                debug!(mac = %request.format_mac(), "request claims no address");
                return self.build_nak(request);
            }
        };

        let hardware = request.chaddr_bytes();
        let lease_time = self.effective_lease_time(request, subnet);

        if subnet.static_binding(hardware) == Some(claimed) {
            info!(mac = %request.format_mac(), address = %claimed, "acknowledging static binding");
            return self
                .build_reply(request, topology, subnet, MessageType::Ack, claimed, lease_time)
                .map_err(|err| error!(%err, "failed to build ack"))
                .ok();
        }

        let Some((pool, _)) = pool_containing(subnet, claimed) else {
            debug!(address = %claimed, subnet = %subnet.cidr(), "claimed address outside pools");
            return self.build_nak(request);
        };

        let confirmed = self
            .retry_once(|| self.allocator.confirm(&pool, claimed, hardware, lease_time, Utc::now()))
            .await;
        match confirmed {
            Ok(lease) => {
                info!(mac = %request.format_mac(), address = %lease.address, "acknowledging lease");
                self.build_reply(request, topology, subnet, MessageType::Ack, claimed, lease_time)
                    .map_err(|err| error!(%err, "failed to build ack"))
                    .ok()
            }
            Err(Error::AddressNotUsable(_)) => {
                debug!(mac = %request.format_mac(), address = %claimed, "claimed address not usable");
                self.build_nak(request)
            }
            Err(err) => {
                warn!(%err, address = %claimed, "confirm failed, dropping request");
                None
            }
        }
    }

    async fn handle_release(&self, request: &DhcpMessage, subnet: &Subnet) {
        let address = request.ciaddr;
        if address.is_unspecified() {
            return;
        }
        let Some((pool, range)) = pool_containing(subnet, address) else {
            debug!(address = %address, "release for address outside pools");
            return;
        };
        match self
            .allocator
            .release_owned(&pool, address, range, request.chaddr_bytes())
            .await
        {
            Ok(()) => info!(mac = %request.format_mac(), address = %address, "released lease"),
            Err(err) => debug!(%err, address = %address, "ignoring invalid release"),
        }
    }

    /// Releases every lease expired at `now` under the current
    /// topology.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let topology = self.topology.snapshot();
        let mut ranges: HashMap<PoolId, AddressRange> = HashMap::new();
        for subnet in topology.subnets() {
            for (index, &range) in subnet.ranges().iter().enumerate() {
                ranges.insert(subnet.pool_id(index), range);
            }
        }
        self.allocator.reclaim_expired(now, &ranges).await
    }

    /// Tries every pool of `subnet` in order; `None` when all are
    /// exhausted.
    async fn allocate_from(
        &self,
        subnet: &Subnet,
        hardware: &[u8],
        lease_time: Duration,
    ) -> Option<crate::store::Lease> {
        for index in 0..subnet.ranges().len() {
            let pool = subnet.pool_id(index);
            let result = self
                .retry_once(|| {
                    self.allocator.allocate(
                        &pool,
                        hardware,
                        lease_time,
                        LeaseStatus::Offered,
                        Utc::now(),
                    )
                })
                .await;
            match result {
                Ok(lease) => return Some(lease),
                Err(Error::PoolExhausted(_)) => continue,
                Err(err) => {
                    warn!(%err, pool = %pool, "allocation failed, dropping request");
                    return None;
                }
            }
        }
        debug!(subnet = %subnet.cidr(), "all pools exhausted");
        None
    }

    /// Runs `op`, retrying one time on a retryable store error.
    async fn retry_once<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match op().await {
            Err(err) if err.is_retryable() => {
                debug!(%err, "retrying after transient store error");
                op().await
            }
            other => other,
        }
    }

    fn effective_lease_time(&self, request: &DhcpMessage, subnet: &Subnet) -> Duration {
        let configured = subnet.lease_time_secs();
        let secs = match request.requested_lease_time() {
            Some(requested) => requested.min(configured),
            None => configured,
        };
        Duration::seconds(i64::from(secs))
    }

    fn build_reply(
        &self,
        request: &DhcpMessage,
        topology: &Topology,
        subnet: &Subnet,
        message_type: MessageType,
        address: Ipv4Addr,
        lease_time: Duration,
    ) -> Result<DhcpMessage> {
        let mut reply = DhcpMessage::reply_to(request, message_type);
        reply.yiaddr = address;
        reply.siaddr = self.server_id;

        reply.insert_option(OPT_SERVER_ID, self.server_id.octets().to_vec())?;
        let lease_secs = u32::try_from(lease_time.num_seconds()).unwrap_or(u32::MAX);
        reply.insert_option(OPT_LEASE_TIME, lease_secs.to_be_bytes().to_vec())?;
        reply.insert_option(OPT_SUBNET_MASK, subnet.cidr().mask().octets().to_vec())?;

        // Later entries win on code collision.
        apply_options(&mut reply, request, topology.pre_options())?;
        apply_options(&mut reply, request, subnet.options())?;
        apply_options(&mut reply, request, topology.post_options())?;

        reply.destination = Some(reply_destination(request));
        Ok(reply)
    }

    fn build_nak(&self, request: &DhcpMessage) -> Option<DhcpMessage> {
        let mut nak = DhcpMessage::reply_to(request, MessageType::Nak);
        nak.insert_option(OPT_SERVER_ID, self.server_id.octets().to_vec())
            .ok()?;
        // NAKs always broadcast: the client has no usable address.
        nak.destination = Some(if request.giaddr.is_unspecified() {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
        } else {
            SocketAddrV4::new(request.giaddr, SERVER_PORT)
        });
        Some(nak)
    }
}

fn apply_options(
    reply: &mut DhcpMessage,
    request: &DhcpMessage,
    entries: &[OptionEntry],
) -> Result<()> {
    for entry in entries {
        if entry.mirror {
            if let Some(value) = request.option(entry.code) {
                reply.insert_option(entry.code, value.to_vec())?;
            }
        } else {
            reply.insert_option(entry.code, entry.value.clone())?;
        }
    }
    Ok(())
}

/// The pool of `subnet` whose range contains `address`, if any.
fn pool_containing(subnet: &Subnet, address: Ipv4Addr) -> Option<(PoolId, AddressRange)> {
    subnet
        .ranges()
        .iter()
        .enumerate()
        .find(|(_, range)| range.contains(address))
        .map(|(index, &range)| (subnet.pool_id(index), range))
}

/// Where to send a reply, per RFC 2131 section 4.1.
fn reply_destination(request: &DhcpMessage) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, SERVER_PORT)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, CLIENT_PORT)
    } else if request.is_broadcast() {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    } else {
        // No relay, no address, no broadcast bit: broadcast anyway,
        // since the client cannot yet receive unicast.
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    }
}
