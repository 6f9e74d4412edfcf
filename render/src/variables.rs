use indexmap::IndexMap;
use tera::Value;
use vcfkit_config::{CommonSettings, DeploymentConfig, MachineSpec, NetworkSettings};

/// Template variables for one host: its own attributes merged with the
/// shared network and common settings.
///
/// Optional settings are only present when configured, so a template that
/// uses one without it being set fails to render instead of printing a blank.
pub fn template_variables(
    config: &DeploymentConfig,
    host: &MachineSpec,
) -> IndexMap<&'static str, Value> {
    let MachineSpec {
        number,
        hostname,
        ip,
        install_disk,
        tiering_disk,
        datastore_name,
    } = host;
    let NetworkSettings {
        gateway,
        vlan_id,
        dns_server,
        netmask,
        subnet: _,
        vswitch_mtu,
    } = config.network();
    let CommonSettings {
        root_password,
        ntp_server,
        esxi_iso_path: _,
        ssh_root_key,
        refind_path: _,
    } = config.common();

    let mut vars = IndexMap::new();

    vars.insert("host_number", Value::from(number.get()));
    vars.insert("hostname", Value::from(hostname.as_str()));
    vars.insert("host_ip", Value::from(ip.to_string()));
    vars.insert("install_disk", Value::from(install_disk.as_str()));
    vars.insert("tiering_disk", Value::from(tiering_disk.as_str()));
    if let Some(datastore_name) = datastore_name {
        vars.insert("datastore_name", Value::from(datastore_name.as_str()));
    }

    vars.insert("vlan_id", Value::from(*vlan_id));
    vars.insert("gateway", Value::from(gateway.to_string()));
    vars.insert("dns_server", Value::from(dns_server.to_string()));
    if let Some(netmask) = netmask {
        vars.insert("netmask", Value::from(netmask.to_string()));
    }
    if let Some(vswitch_mtu) = vswitch_mtu {
        vars.insert("vswitch_mtu", Value::from(*vswitch_mtu));
    }

    vars.insert("ntp_server", Value::from(ntp_server.as_str()));
    vars.insert("root_password", Value::from(root_password.as_str()));
    if let Some(ssh_root_key) = ssh_root_key {
        vars.insert("ssh_key", Value::from(ssh_root_key.as_str()));
    }

    vars.insert("host_count", Value::from(config.hosts().len()));

    vars
}
