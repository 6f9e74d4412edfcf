use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use vcfkit_cmd::Command;
use vcfkit_fs as fs;

use crate::{BlockDevice, Partition, Platform, PlatformError, VolumeLabel, mount_dir};

/// macOS, via `diskutil` and `hdiutil`.
#[derive(Debug, Default)]
pub struct MacOs;

fn diskutil() -> Command {
    let mut command = Command::new("diskutil");
    command.env("LC_ALL", "C");
    command
}

async fn disk_info(identifier: &str) -> Result<HashMap<String, String>, PlatformError> {
    let output = diskutil()
        .args(["info", identifier])
        .run_to_string()
        .await?;
    Ok(parse_info(&output))
}

#[async_trait]
impl Platform for MacOs {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["diskutil", "hdiutil", "sync"]
    }

    async fn list_devices(&self) -> Result<Vec<BlockDevice>, PlatformError> {
        let output = diskutil().arg("list").run_to_string().await?;
        let mut devices = Vec::new();

        for listed in parse_list(&output) {
            let info = disk_info(&listed.node).await?;
            let mut partitions = Vec::with_capacity(listed.partitions.len());
            for identifier in &listed.partitions {
                let info = disk_info(identifier).await?;
                partitions.push(Partition {
                    path: PathBuf::from(format!("/dev/{identifier}")),
                    label: non_empty(info.get("Volume Name")),
                    mount_points: mount_point(&info).into_iter().collect(),
                });
            }
            devices.push(device_from_info(&listed, &info, partitions));
        }

        Ok(devices)
    }

    async fn unmount_device(&self, device: &Path) -> Result<(), PlatformError> {
        diskutil().arg("unmountDisk").arg(device).run().await?;
        Ok(())
    }

    async fn format(&self, device: &Path, label: &VolumeLabel) -> Result<(), PlatformError> {
        diskutil()
            .arg("partitionDisk")
            .arg(device)
            .args(["1", "MBRFormat", "MS-DOS FAT32", label.as_str(), "R"])
            .run()
            .await?;
        Ok(())
    }

    async fn mount(&self, device: &Path, _label: &VolumeLabel) -> Result<PathBuf, PlatformError> {
        let partition = format!("{}s1", device.display());
        diskutil().args(["mount", partition.as_str()]).run().await?;
        let info = disk_info(&partition).await?;
        mount_point(&info).ok_or_else(|| PlatformError::MountPointNotFound {
            device: PathBuf::from(partition),
        })
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), PlatformError> {
        diskutil().arg("unmount").arg(mount_point).run().await?;
        Ok(())
    }

    async fn eject(&self, device: &Path) -> Result<(), PlatformError> {
        diskutil().arg("eject").arg(device).run().await?;
        Ok(())
    }

    async fn attach_image(&self, image: &Path) -> Result<PathBuf, PlatformError> {
        let mount_point = mount_dir("image");
        fs::create_dir(&mount_point).await?;
        Command::new("hdiutil")
            .arg("attach")
            .arg(image)
            .arg("-mountpoint")
            .arg(&mount_point)
            .args(["-readonly", "-nobrowse"])
            .run()
            .await?;
        Ok(mount_point)
    }

    async fn detach_image(&self, mount_point: &Path) -> Result<(), PlatformError> {
        Command::new("hdiutil")
            .arg("detach")
            .arg(mount_point)
            .run()
            .await?;
        if let Err(err) = fs::remove_dir(mount_point).await {
            debug!("leaving mount point in place: {err}");
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), PlatformError> {
        Command::new("sync").run().await?;
        Ok(())
    }
}

/// One whole disk from `diskutil list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListedDisk {
    pub node: String,
    pub external: bool,
    pub partitions: Vec<String>,
    pub apfs: bool,
}

/// Parse `diskutil list`:
///
/// ```text
/// /dev/disk4 (external, physical):
///    #:                       TYPE NAME                    SIZE       IDENTIFIER
///    0:     FDisk_partition_scheme                        *32.0 GB    disk4
///    1:                 DOS_FAT_32 ESXI                    32.0 GB    disk4s1
/// ```
///
/// Synthesized APFS containers and disk images are skipped.
pub(crate) fn parse_list(output: &str) -> Vec<ListedDisk> {
    let mut disks: Vec<ListedDisk> = Vec::new();
    let mut skipping = false;

    for line in output.lines() {
        if let Some(header) = line.strip_prefix("/dev/") {
            let (name, kind) = match header.split_once(' ') {
                Some((name, kind)) => (name, kind),
                None => (header.trim_end_matches(':'), ""),
            };
            skipping = kind.contains("synthesized") || kind.contains("disk image");
            if !skipping {
                disks.push(ListedDisk {
                    node: format!("/dev/{name}"),
                    external: kind.contains("external"),
                    partitions: Vec::new(),
                    apfs: false,
                });
            }
            continue;
        }
        if skipping {
            continue;
        }
        let Some(disk) = disks.last_mut() else {
            continue;
        };
        let Some(identifier) = line.split_whitespace().last() else {
            continue;
        };
        if line.contains("Apple_APFS") {
            disk.apfs = true;
        }
        let whole = disk.node.trim_start_matches("/dev/");
        if identifier != whole && identifier.starts_with(whole) {
            disk.partitions.push(identifier.to_owned());
        }
    }

    disks
}

/// Parse `diskutil info`'s `Key:   Value` lines.
pub(crate) fn parse_info(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .filter(|value| !value.is_empty() && !value.starts_with("Not applicable"))
        .cloned()
}

fn mount_point(info: &HashMap<String, String>) -> Option<PathBuf> {
    non_empty(info.get("Mount Point")).map(PathBuf::from)
}

/// `32.0 GB (32015679488 Bytes) (exactly 62530624 512-Byte-Units)` → bytes.
fn disk_size(info: &HashMap<String, String>) -> Option<u64> {
    let value = info.get("Disk Size").or_else(|| info.get("Total Size"))?;
    let (_, rest) = value.split_once('(')?;
    let (bytes, _) = rest.split_once(' ')?;
    bytes.parse().ok()
}

fn device_from_info(
    listed: &ListedDisk,
    info: &HashMap<String, String>,
    partitions: Vec<Partition>,
) -> BlockDevice {
    let removable = listed.external
        || info
            .get("Removable Media")
            .is_some_and(|value| value == "Removable")
        || info.get("Protocol").is_some_and(|value| value == "USB");
    let mount_points: Vec<PathBuf> = mount_point(info).into_iter().collect();
    let system = !listed.external
        && (listed.apfs
            || partitions
                .iter()
                .flat_map(|p| p.mount_points.iter())
                .chain(mount_points.iter())
                .any(|mount| mount == Path::new("/")));

    BlockDevice {
        path: PathBuf::from(&listed.node),
        model: non_empty(info.get("Device / Media Name").or_else(|| info.get("Media Name"))),
        size: disk_size(info),
        removable,
        transport: non_empty(info.get("Protocol")).map(|p| p.to_lowercase()),
        system,
        mount_points,
        partitions,
    }
}
