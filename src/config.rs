//! Configuration: JSON descriptors turned into a validated topology.
//!
//! The descriptors here stay close to what an operator writes; the
//! [`Config::build_topology`] step is where everything is validated
//! and cross-checked, so invalid configuration can never reach the
//! request path. Reloads build a fresh topology from a fresh `Config`
//! and publish it; a failed build leaves the old snapshot serving.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cidr::{AddressRange, InetCidr};
use crate::error::{Error, Result};
use crate::filter::{NumOperator, RequestFilter, StringMatchMode};
use crate::topology::{OptionEntry, Subnet, Topology};

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address advertised as the server identifier (option 54).
    pub server_id: Ipv4Addr,

    pub subnets: Vec<SubnetConfig>,

    #[serde(default)]
    pub global_filter: Option<FilterConfig>,

    /// Options applied to every reply before subnet options.
    #[serde(default)]
    pub pre_options: Vec<OptionConfig>,

    /// Options applied to every reply after subnet options.
    #[serde(default)]
    pub post_options: Vec<OptionConfig>,

    /// Where lease state is persisted, if anywhere.
    #[serde(default)]
    pub lease_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// `address/prefix` notation, e.g. `"192.168.1.0/24"`.
    pub cidr: String,

    /// Relay addresses that route to this subnet.
    #[serde(default)]
    pub giaddrs: Vec<Ipv4Addr>,

    #[serde(default)]
    pub ranges: Vec<RangeConfig>,

    #[serde(default)]
    pub options: Vec<OptionConfig>,

    #[serde(default)]
    pub static_bindings: Vec<BindingConfig>,

    #[serde(default)]
    pub filter: Option<FilterConfig>,

    #[serde(default)]
    pub lease_time_secs: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Colon-separated hardware address, e.g. `"aa:bb:cc:dd:ee:ff"`.
    pub hardware: String,
    pub address: Ipv4Addr,
}

/// An option value in whichever shape is most natural to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// A single IPv4 address, encoded as its 4 octets.
    Ip(Ipv4Addr),
    /// A list of addresses, octets concatenated.
    IpList(Vec<Ipv4Addr>),
    /// UTF-8 text, encoded as its bytes.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl OptionValue {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ip(addr) => addr.octets().to_vec(),
            Self::IpList(addrs) => addrs.iter().flat_map(|a| a.octets()).collect(),
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionConfig {
    pub code: u8,

    #[serde(default)]
    pub value: Option<OptionValue>,

    /// Echo the client's own value for this code instead of `value`.
    #[serde(default)]
    pub mirror: bool,
}

impl OptionConfig {
    fn build(&self) -> Result<OptionEntry> {
        if self.code == 0 || self.code == 255 {
            return Err(Error::InvalidConfig(format!(
                "option code {} is a reserved wire marker",
                self.code
            )));
        }
        if !self.mirror && self.value.is_none() {
            return Err(Error::InvalidConfig(format!(
                "option {} needs a value unless it mirrors",
                self.code
            )));
        }
        let value = self.value.as_ref().map(OptionValue::to_bytes).unwrap_or_default();
        if value.len() > 255 {
            return Err(Error::InvalidConfig(format!(
                "option {} value is {} bytes (maximum 255)",
                self.code,
                value.len()
            )));
        }
        Ok(OptionEntry {
            code: self.code,
            value,
            mirror: self.mirror,
        })
    }
}

/// A filter expression as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    Accept,
    Nand {
        filters: Vec<FilterConfig>,
    },
    StringOption {
        code: u8,
        pattern: String,
        mode: StringMatchMode,
    },
    NumOption {
        code: u8,
        value: u64,
        operator: NumOperator,
    },
}

impl FilterConfig {
    pub fn build(&self) -> Result<RequestFilter> {
        Ok(match self {
            Self::Accept => RequestFilter::AlwaysAccept,
            Self::Nand { filters } => {
                let built: Result<Vec<_>> = filters.iter().map(Self::build).collect();
                RequestFilter::nand(built?)?
            }
            Self::StringOption { code, pattern, mode } => {
                RequestFilter::string_option(*code, pattern, *mode)?
            }
            Self::NumOption {
                code,
                value,
                operator,
            } => RequestFilter::num_option(*code, *value, *operator),
        })
    }
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        info!(path = %path.display(), subnets = config.subnets.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds a validated [`Topology`] snapshot from this config.
    ///
    /// All validation happens here: CIDR and hardware-address syntax,
    /// range containment, giaddr uniqueness, filter well-formedness,
    /// and option shape. Nothing is published on error.
    pub fn build_topology(&self) -> Result<Topology> {
        let mut builder = Topology::builder();

        if let Some(filter) = &self.global_filter {
            builder.global_filter(filter.build()?);
        }
        builder.pre_options(build_options(&self.pre_options)?);
        builder.post_options(build_options(&self.post_options)?);

        for subnet_config in &self.subnets {
            let cidr: InetCidr = subnet_config.cidr.parse()?;
            let mut subnet = Subnet::new(cidr);

            for &giaddr in &subnet_config.giaddrs {
                subnet = subnet.with_giaddr(giaddr);
            }
            for range in &subnet_config.ranges {
                subnet = subnet.with_range(AddressRange::new(range.start, range.end)?)?;
            }
            for option in &subnet_config.options {
                subnet = subnet.with_option(option.build()?);
            }
            for binding in &subnet_config.static_bindings {
                let hardware = parse_hardware(&binding.hardware)?;
                if !cidr.contains(binding.address) {
                    return Err(Error::InvalidConfig(format!(
                        "static binding {} is outside subnet {}",
                        binding.address, cidr
                    )));
                }
                subnet = subnet.with_static_binding(hardware, binding.address);
            }
            if let Some(filter) = &subnet_config.filter {
                subnet = subnet.with_filter(filter.build()?);
            }
            if let Some(secs) = subnet_config.lease_time_secs {
                subnet = subnet.with_lease_time(secs);
            }

            builder.add_subnet(subnet)?;
        }

        Ok(builder.build())
    }
}

fn build_options(configs: &[OptionConfig]) -> Result<Vec<OptionEntry>> {
    configs.iter().map(OptionConfig::build).collect()
}

/// Parses a colon-separated hardware address.
fn parse_hardware(s: &str) -> Result<Vec<u8>> {
    let bytes: std::result::Result<Vec<u8>, _> = s
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect();
    match bytes {
        Ok(bytes) if !bytes.is_empty() && bytes.len() <= 16 => Ok(bytes),
        _ => Err(Error::InvalidAddress(format!(
            "bad hardware address {:?}",
            s
        ))),
    }
}
