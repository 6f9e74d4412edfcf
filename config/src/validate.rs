use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::net::Ipv4Addr;

use displaydoc::Display;

use crate::model::{CommonSettings, HostNumber, MachineSpec, NetworkSettings};

const MAX_VLAN_ID: u16 = 4094;

/// A single reason a deployment configuration is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ConfigProblem {
    /// no hosts are defined
    NoHosts,
    /// host number must be at least 1 (found host {hostname:?} with number 0)
    ZeroHostNumber { hostname: String },
    /// host number {number} is used more than once
    DuplicateHostNumber { number: HostNumber },
    /// hostname {hostname:?} is used more than once
    DuplicateHostname { hostname: String },
    /// IP address {ip} is used more than once
    DuplicateIp { ip: Ipv4Addr },
    /// host {number}: install_disk and tiering_disk are both {disk:?}
    SameInstallAndTieringDisk { number: HostNumber, disk: String },
    /// vlan_id {vlan_id} is out of range (0-4094)
    VlanOutOfRange { vlan_id: u16 },
    /// {field} must not be empty
    Empty { field: String },
}

/// All problems found in one configuration, printed one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblems(pub Vec<ConfigProblem>);

impl Display for ConfigProblems {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for problem in &self.0 {
            write!(f, "\n  - {problem}")?;
        }
        Ok(())
    }
}

pub(crate) fn validate(
    network: &NetworkSettings,
    common: &CommonSettings,
    hosts: &[MachineSpec],
) -> Vec<ConfigProblem> {
    let mut problems = Vec::new();

    if network.vlan_id > MAX_VLAN_ID {
        problems.push(ConfigProblem::VlanOutOfRange {
            vlan_id: network.vlan_id,
        });
    }

    for (field, value) in [
        ("common.root_password", &common.root_password),
        ("common.ntp_server", &common.ntp_server),
    ] {
        if value.trim().is_empty() {
            problems.push(ConfigProblem::Empty {
                field: field.to_owned(),
            });
        }
    }

    if hosts.is_empty() {
        problems.push(ConfigProblem::NoHosts);
    }

    let mut numbers = BTreeSet::new();
    let mut hostnames = BTreeSet::new();
    let mut ips = BTreeSet::new();

    for host in hosts {
        let MachineSpec {
            number,
            hostname,
            ip,
            install_disk,
            tiering_disk,
            datastore_name: _,
        } = host;

        if number.get() == 0 {
            problems.push(ConfigProblem::ZeroHostNumber {
                hostname: hostname.clone(),
            });
        } else if !numbers.insert(*number) {
            problems.push(ConfigProblem::DuplicateHostNumber { number: *number });
        }

        if hostname.trim().is_empty() {
            problems.push(ConfigProblem::Empty {
                field: format!("hosts[{number}].hostname"),
            });
        } else if !hostnames.insert(hostname.to_lowercase()) {
            problems.push(ConfigProblem::DuplicateHostname {
                hostname: hostname.clone(),
            });
        }

        if !ips.insert(*ip) {
            problems.push(ConfigProblem::DuplicateIp { ip: *ip });
        }

        for (field, disk) in [("install_disk", install_disk), ("tiering_disk", tiering_disk)] {
            if disk.as_str().trim().is_empty() {
                problems.push(ConfigProblem::Empty {
                    field: format!("hosts[{number}].{field}"),
                });
            }
        }

        if install_disk == tiering_disk && !install_disk.as_str().trim().is_empty() {
            problems.push(ConfigProblem::SameInstallAndTieringDisk {
                number: *number,
                disk: install_disk.to_string(),
            });
        }
    }

    problems
}
