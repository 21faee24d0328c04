//! # dhcpool
//!
//! A DHCP server core: the wire codec, subnet topology, admission
//! filters, and a transactional free-interval ("bubble") lease
//! allocator. The surrounding process supplies the UDP listener and
//! hands raw datagrams to [`Engine::handle_datagram`]; everything from
//! decode to reply bytes happens here.
//!
//! ## Example
//!
//! ```no_run
//! use dhcpool::{Allocator, Config, Engine, MemoryStore, TopologyHandle};
//!
//! # #[tokio::main]
//! # async fn main() -> dhcpool::Result<()> {
//! let config = Config::load("dhcpool.json")?;
//! let topology = TopologyHandle::new(config.build_topology()?);
//!
//! let store = match &config.lease_file {
//!     Some(path) => MemoryStore::with_persistence(path)?,
//!     None => MemoryStore::new(),
//! };
//! let engine = Engine::new(topology, Allocator::new(store), config.server_id);
//! engine.provision().await?;
//!
//! // For each received datagram:
//! let datagram: &[u8] = &[];
//! let local_ip = config.server_id;
//! if let Some(_reply) = engine.handle_datagram(datagram, local_ip).await {
//!     // send the reply to the decoded message's destination
//! }
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod cidr;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod options;
pub mod packet;
pub mod store;
pub mod topology;

pub use allocator::{Allocator, BubbleOp, plan_allocation, plan_claim, plan_release};
pub use cidr::{AddressRange, InetCidr, cidrs_containing};
pub use config::{Config, FilterConfig, OptionConfig, SubnetConfig};
pub use engine::{CLIENT_PORT, Engine, SERVER_PORT};
pub use error::{Error, Result};
pub use filter::{NandChain, NumOperator, RequestFilter, StringMatchMode};
pub use options::MessageType;
pub use packet::{BOOTREPLY, BOOTREQUEST, DhcpMessage, FIXED_HEADER_SIZE, MAX_PACKET_SIZE};
pub use store::{Bubble, Lease, LeaseStatus, LeaseStore, MemoryStore, PoolId, StoreTxn};
pub use topology::{OptionEntry, Subnet, Topology, TopologyBuilder, TopologyHandle};
