mod model;
mod validate;

use comfy_table::Table;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::read_to_string;
use tracing::debug;

pub use crate::model::{CommonSettings, DiskId, HostNumber, MachineSpec, NetworkSettings};
pub use crate::validate::{ConfigProblem, ConfigProblems};

/// Default config location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/vcf-config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config file {path}:{problems}")]
    Invalid {
        path: PathBuf,
        problems: ConfigProblems,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// `.toml` files are TOML, everything else is treated as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DeploymentConfigFile {
    network: NetworkSettings,
    common: CommonSettings,
    hosts: Vec<MachineSpec>,
}

/// Deployment configuration shared by the renderer and the imagers.
///
/// Immutable once loaded. Hosts are validated and sorted by number.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    path: PathBuf,
    network: NetworkSettings,
    common: CommonSettings,
    hosts: Vec<MachineSpec>,
}

impl DeploymentConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = match read_to_string(path).await {
            Ok(source) => source,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_owned()));
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        Self::parse(&source, ConfigFormat::from_path(path), path)
    }

    /// Parse and validate config source. `path` is only used for error
    /// messages and to resolve sibling files.
    pub fn parse(source: &str, format: ConfigFormat, path: &Path) -> Result<Self, ConfigError> {
        let file: DeploymentConfigFile = match format {
            ConfigFormat::Yaml => {
                serde_yaml::from_str(source).map_err(|source| ConfigError::ParseYaml {
                    path: path.to_owned(),
                    source,
                })?
            }
            ConfigFormat::Toml => {
                toml::from_str(source).map_err(|source| ConfigError::ParseToml {
                    path: path.to_owned(),
                    source,
                })?
            }
        };

        let DeploymentConfigFile {
            network,
            common,
            mut hosts,
        } = file;

        let problems = validate::validate(&network, &common, &hosts);
        if !problems.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_owned(),
                problems: ConfigProblems(problems),
            });
        }

        hosts.sort_by_key(|host| host.number);
        debug!(path = %path.display(), hosts = hosts.len(), "loaded config");

        Ok(Self {
            path: path.to_owned(),
            network,
            common,
            hosts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the config file, where the template and rendered
    /// kickstarts live by default.
    pub fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }

    pub fn common(&self) -> &CommonSettings {
        &self.common
    }

    /// Hosts in ascending number order.
    pub fn hosts(&self) -> &[MachineSpec] {
        &self.hosts
    }

    pub fn host(&self, number: HostNumber) -> Option<&MachineSpec> {
        self.hosts.iter().find(|host| host.number == number)
    }

    pub fn host_numbers(&self) -> Vec<HostNumber> {
        self.hosts.iter().map(|host| host.number).collect()
    }

    /// Shared settings an operator checks after rendering.
    pub fn summary(&self) -> String {
        let NetworkSettings {
            gateway,
            vlan_id,
            dns_server,
            subnet,
            ..
        } = &self.network;
        format!(
            "Configuration:\n\
             \x20 Config File: {}\n\
             \x20 Network:     {}\n\
             \x20 Gateway:     {gateway}\n\
             \x20 VLAN:        {vlan_id}\n\
             \x20 DNS:         {dns_server}\n\
             \x20 NTP:         {}\n",
            self.path.display(),
            subnet.as_deref().unwrap_or("-"),
            self.common.ntp_server,
        )
    }

    pub fn print_hosts(&self) {
        let mut table = Table::new();
        table
            .load_preset(comfy_table::presets::UTF8_FULL)
            .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
            .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
            .set_header(vec![
                "number",
                "hostname",
                "ip",
                "install disk",
                "tiering disk",
                "kickstart",
            ]);

        for host in self.hosts() {
            let MachineSpec {
                number,
                hostname,
                ip,
                install_disk,
                tiering_disk,
                datastore_name: _,
            } = host;
            table.add_row(vec![
                number.to_string(),
                hostname.clone(),
                ip.to_string(),
                install_disk.to_string(),
                tiering_disk.to_string(),
                number.kickstart_file_name(),
            ]);
        }

        println!("{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    pub(crate) const THREE_HOSTS: &str = r#"
network:
  gateway: 192.168.10.1
  vlan_id: 10
  dns_server: 192.168.10.2
  netmask: 255.255.255.0
  subnet: 192.168.10.0/24
  vswitch_mtu: 9000
common:
  root_password: VMware1!VMware1!
  ntp_server: pool.ntp.org
  esxi_iso_path: /isos/VMware-VMvisor-Installer-9.0.0.x86_64.iso
hosts:
  - number: 3
    hostname: esx03.lab.local
    ip: 192.168.10.12
    install_disk: t10.NVMe____Samsung_SSD_990_PRO_3
    tiering_disk: t10.NVMe____Samsung_SSD_980_PRO_3
  - number: 1
    hostname: esx01.lab.local
    ip: 192.168.10.10
    install_disk: t10.NVMe____Samsung_SSD_990_PRO_1
    tiering_disk: t10.NVMe____Samsung_SSD_980_PRO_1
    datastore_name: esx01-local
  - number: 2
    hostname: esx02.lab.local
    ip: 192.168.10.11
    install_disk: t10.NVMe____Samsung_SSD_990_PRO_2
    tiering_disk: t10.NVMe____Samsung_SSD_980_PRO_2
"#;

    fn parse_yaml(source: &str) -> Result<DeploymentConfig, ConfigError> {
        DeploymentConfig::parse(source, ConfigFormat::Yaml, Path::new("config/vcf-config.yaml"))
    }

    fn problems(err: ConfigError) -> Vec<ConfigProblem> {
        match err {
            ConfigError::Invalid { problems, .. } => problems.0,
            other => panic!("expected invalid config, got: {other}"),
        }
    }

    #[test]
    fn parses_and_sorts_hosts() {
        let config = parse_yaml(THREE_HOSTS).unwrap();

        let names: Vec<&str> = config.hosts().iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(
            names,
            ["esx01.lab.local", "esx02.lab.local", "esx03.lab.local"]
        );
        assert_eq!(config.network().vlan_id, 10);
        assert_eq!(config.network().gateway, Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(
            config.host(HostNumber::new(2)).unwrap().ip,
            Ipv4Addr::new(192, 168, 10, 11)
        );
        assert!(config.host(HostNumber::new(4)).is_none());
        assert_eq!(config.dir(), Path::new("config"));
    }

    #[test]
    fn summarises_shared_settings() {
        let config = parse_yaml(THREE_HOSTS).unwrap();
        assert_eq!(
            config.summary(),
            "Configuration:\n\
             \x20 Config File: config/vcf-config.yaml\n\
             \x20 Network:     192.168.10.0/24\n\
             \x20 Gateway:     192.168.10.1\n\
             \x20 VLAN:        10\n\
             \x20 DNS:         192.168.10.2\n\
             \x20 NTP:         pool.ntp.org\n"
        );

        let config = parse_yaml(&THREE_HOSTS.replace("  subnet: 192.168.10.0/24\n", "")).unwrap();
        assert!(config.summary().contains("  Network:     -\n"));
    }

    #[test]
    fn rejects_duplicate_host_number() {
        let source = THREE_HOSTS.replace("number: 3", "number: 2");
        assert_eq!(
            problems(parse_yaml(&source).unwrap_err()),
            vec![ConfigProblem::DuplicateHostNumber {
                number: HostNumber::new(2)
            }]
        );
    }

    #[test]
    fn rejects_same_install_and_tiering_disk() {
        let source = THREE_HOSTS.replace(
            "tiering_disk: t10.NVMe____Samsung_SSD_980_PRO_1",
            "tiering_disk: t10.NVMe____Samsung_SSD_990_PRO_1",
        );
        assert_eq!(
            problems(parse_yaml(&source).unwrap_err()),
            vec![ConfigProblem::SameInstallAndTieringDisk {
                number: HostNumber::new(1),
                disk: "t10.NVMe____Samsung_SSD_990_PRO_1".to_owned(),
            }]
        );
    }

    #[test]
    fn collects_every_problem() {
        let source = THREE_HOSTS
            .replace("vlan_id: 10", "vlan_id: 5000")
            .replace("ip: 192.168.10.12", "ip: 192.168.10.10")
            .replace("number: 3", "number: 0");
        let found = problems(parse_yaml(&source).unwrap_err());
        assert!(found.contains(&ConfigProblem::VlanOutOfRange { vlan_id: 5000 }));
        assert!(found.contains(&ConfigProblem::DuplicateIp {
            ip: Ipv4Addr::new(192, 168, 10, 10)
        }));
        assert!(found.contains(&ConfigProblem::ZeroHostNumber {
            hostname: "esx03.lab.local".to_owned()
        }));
    }

    #[test]
    fn rejects_empty_host_list() {
        let source = r#"
network: { gateway: 10.0.0.1, vlan_id: 0, dns_server: 10.0.0.2 }
common: { root_password: secret, ntp_server: 10.0.0.3 }
hosts: []
"#;
        assert_eq!(
            problems(parse_yaml(source).unwrap_err()),
            vec![ConfigProblem::NoHosts]
        );
    }

    #[test]
    fn missing_section_reports_location() {
        let source = "network:\n  gateway: 10.0.0.1\n";
        let err = parse_yaml(source).unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml { .. }));
        assert!(err.to_string().contains("config/vcf-config.yaml"));
    }

    #[test]
    fn parses_toml() {
        let source = r#"
[network]
gateway = "10.0.0.1"
vlan_id = 20
dns_server = "10.0.0.2"

[common]
root_password = "secret"
ntp_server = "10.0.0.3"

[[hosts]]
number = 1
hostname = "esx01.lab.local"
ip = "10.0.0.10"
install_disk = "disk-a"
tiering_disk = "disk-b"
"#;
        let config =
            DeploymentConfig::parse(source, ConfigFormat::Toml, Path::new("vcf.toml")).unwrap();
        assert_eq!(config.hosts().len(), 1);
        assert_eq!(config.network().vlan_id, 20);
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a")), ConfigFormat::Yaml);
    }

    #[tokio::test]
    async fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vcf-config.yaml");
        let err = DeploymentConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p == path));
    }

    #[tokio::test]
    async fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vcf-config.yaml");
        tokio::fs::write(&path, THREE_HOSTS).await.unwrap();

        let config = DeploymentConfig::load(&path).await.unwrap();
        assert_eq!(config.hosts().len(), 3);
        assert_eq!(config.dir(), dir.path());
    }
}
