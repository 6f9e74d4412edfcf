use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

/// Ordinal of a host within the deployment, starting at 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct HostNumber(u32);

impl HostNumber {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// File name of the rendered kickstart for this host, e.g. `ks-esx01.cfg`.
    ///
    /// The renderer writes this name and the imagers look it up, so it must
    /// stay stable.
    pub fn kickstart_file_name(&self) -> String {
        format!("ks-esx{:02}.cfg", self.0)
    }

    /// Name of the kickstart once embedded on the FAT boot volume, e.g.
    /// `KS-ESX01.CFG`. The ESXi bootloader upper-cases paths.
    pub fn embedded_kickstart_name(&self) -> String {
        self.kickstart_file_name().to_uppercase()
    }
}

impl Display for HostNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for HostNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(HostNumber)
    }
}

/// A vendor storage device identifier, e.g. `t10.NVMe____Samsung_SSD_990...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct DiskId(String);

impl DiskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DiskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkSettings {
    pub gateway: Ipv4Addr,
    pub vlan_id: u16,
    pub dns_server: Ipv4Addr,
    #[serde(default)]
    pub netmask: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub vswitch_mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommonSettings {
    pub root_password: String,
    pub ntp_server: String,
    #[serde(default)]
    pub esxi_iso_path: Option<PathBuf>,
    #[serde(default)]
    pub ssh_root_key: Option<String>,
    /// Extracted rEFInd distribution used by the boot menu installer.
    #[serde(default)]
    pub refind_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MachineSpec {
    pub number: HostNumber,
    pub hostname: String,
    pub ip: Ipv4Addr,
    /// Overwritten by the ESXi installer.
    pub install_disk: DiskId,
    /// Left alone during install, configured for memory tiering afterwards.
    pub tiering_disk: DiskId,
    #[serde(default)]
    pub datastore_name: Option<String>,
}
