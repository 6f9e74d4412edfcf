use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, de};
use tracing::{debug, info};
use vcfkit_cmd::{Command, CommandError};
use vcfkit_fs as fs;

use crate::{BlockDevice, Partition, Platform, PlatformError, VolumeLabel, mount_dir};

/// Mount points which mark a disk as hosting the running system.
const SYSTEM_MOUNT_POINTS: &[&str] = &["/", "/boot", "/boot/efi", "/usr", "/var", "[SWAP]"];

/// `MOUNTPOINTS` lists every mount of a device; util-linux before 2.37 only
/// knows `MOUNTPOINT`, which shows one.
const LSBLK_COLUMNS: &str = "NAME,MODEL,SIZE,RM,HOTPLUG,TRAN,TYPE,MOUNTPOINTS,LABEL";
const LSBLK_COLUMNS_LEGACY: &str = "NAME,MODEL,SIZE,RM,HOTPLUG,TRAN,TYPE,MOUNTPOINT,LABEL";

/// Linux, via util-linux (`lsblk`, `wipefs`, `mount`, `eject`), `parted` and
/// `mkfs.vfat`.
#[derive(Debug, Default)]
pub struct Linux;

#[async_trait]
impl Platform for Linux {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &[
            "lsblk",
            "wipefs",
            "parted",
            "udevadm",
            "mkfs.vfat",
            "mount",
            "umount",
            "eject",
            "sync",
        ]
    }

    async fn list_devices(&self) -> Result<Vec<BlockDevice>, PlatformError> {
        let output = match lsblk(LSBLK_COLUMNS).await {
            Ok(output) => output,
            Err(CommandError::Failure { stderr, .. }) => {
                debug!("lsblk without MOUNTPOINTS support: {stderr}");
                lsblk(LSBLK_COLUMNS_LEGACY).await?
            }
            Err(err) => return Err(err.into()),
        };
        parse_lsblk(&output)
    }

    async fn unmount_device(&self, device: &Path) -> Result<(), PlatformError> {
        let devices = self.list_devices().await?;
        let device = devices
            .into_iter()
            .find(|d| d.path == device)
            .ok_or_else(|| PlatformError::UnknownDevice(device.to_owned()))?;

        for mut command in unmount_commands(&device) {
            info!(command = %command, "unmounting");
            command.run().await?;
        }
        Ok(())
    }

    async fn format(&self, device: &Path, label: &VolumeLabel) -> Result<(), PlatformError> {
        let [mut wipe, mut partition, mut settle, mut mkfs] = format_commands(device, label);
        wipe.run().await?;
        partition.run().await?;
        // settle times out on busy systems; the partition node usually exists anyway.
        settle.run_allow_failure().await?;
        mkfs.run().await?;
        Ok(())
    }

    async fn mount(&self, device: &Path, label: &VolumeLabel) -> Result<PathBuf, PlatformError> {
        let mount_point = mount_dir(&label.as_str().to_lowercase());
        fs::create_dir(&mount_point).await?;
        Command::new("mount")
            .args(["-t", "vfat"])
            .arg(first_partition(device))
            .arg(&mount_point)
            .run()
            .await?;
        Ok(mount_point)
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), PlatformError> {
        Command::new("umount").arg(mount_point).run().await?;
        remove_mount_dir(mount_point).await;
        Ok(())
    }

    async fn eject(&self, device: &Path) -> Result<(), PlatformError> {
        Command::new("eject").arg(device).run().await?;
        Ok(())
    }

    async fn attach_image(&self, image: &Path) -> Result<PathBuf, PlatformError> {
        let mount_point = mount_dir("image");
        fs::create_dir(&mount_point).await?;
        Command::new("mount")
            .args(["-o", "loop,ro"])
            .arg(image)
            .arg(&mount_point)
            .run()
            .await?;
        Ok(mount_point)
    }

    async fn detach_image(&self, mount_point: &Path) -> Result<(), PlatformError> {
        Command::new("umount").arg(mount_point).run().await?;
        remove_mount_dir(mount_point).await;
        Ok(())
    }

    async fn sync(&self) -> Result<(), PlatformError> {
        Command::new("sync").run().await?;
        Ok(())
    }
}

async fn lsblk(columns: &str) -> Result<String, CommandError> {
    Command::new("lsblk")
        .args(["--json", "--bytes", "--paths", "--output", columns])
        .run_to_string()
        .await
}

/// One `umount` per mount point, so a partition mounted in several places is
/// fully released. Swap and other pseudo mount points are skipped.
fn unmount_commands(device: &BlockDevice) -> Vec<Command> {
    device
        .all_mount_points()
        .filter(|mount| mount.is_absolute())
        .map(|mount| {
            let mut command = Command::new("umount");
            command.arg(mount);
            command
        })
        .collect()
}

/// Wipe signatures, write an MBR with one bootable FAT32 partition, wait for
/// udev, then make the filesystem.
fn format_commands(device: &Path, label: &VolumeLabel) -> [Command; 4] {
    let mut wipe = Command::new("wipefs");
    wipe.arg("--all").arg(device);

    let mut partition = Command::new("parted");
    partition.arg("--script").arg(device).args([
        "mklabel", "msdos", "mkpart", "primary", "fat32", "1MiB", "100%", "set", "1", "boot",
        "on",
    ]);

    let mut settle = Command::new("udevadm");
    settle.arg("settle");

    let mut mkfs = Command::new("mkfs.vfat");
    mkfs.args(["-F", "32", "-n", label.as_str()])
        .arg(first_partition(device));

    [wipe, partition, settle, mkfs]
}

async fn remove_mount_dir(mount_point: &Path) {
    if let Err(err) = fs::remove_dir(mount_point).await {
        debug!("leaving mount point in place: {err}");
    }
}

/// `/dev/sdb` → `/dev/sdb1`, `/dev/nvme0n1` → `/dev/nvme0n1p1`.
pub(crate) fn first_partition(device: &Path) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p1"))
    } else {
        PathBuf::from(format!("{name}1"))
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: PathBuf,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_size")]
    size: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    rm: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    hotplug: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<PathBuf>,
    /// Unmounted devices report `[null]`.
    #[serde(default)]
    mountpoints: Vec<Option<PathBuf>>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn mount_points(&self) -> Vec<PathBuf> {
        let mut mounts: Vec<PathBuf> = self.mountpoints.iter().flatten().cloned().collect();
        if let Some(mount) = &self.mountpoint {
            if !mounts.contains(mount) {
                mounts.push(mount.clone());
            }
        }
        mounts
    }

    /// Mount points of this device and everything below it, such as LVM or
    /// LUKS volumes stacked on a partition.
    fn nested_mount_points(&self) -> Vec<PathBuf> {
        let mut mounts = self.mount_points();
        for child in &self.children {
            mounts.extend(child.nested_mount_points());
        }
        mounts
    }
}

/// Older lsblk prints flags as `"0"`/`"1"` strings, newer as booleans.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(u8),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flag::Bool(value)) => Ok(value),
        Some(Flag::Number(value)) => Ok(value != 0),
        Some(Flag::Text(value)) => match value.as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid lsblk flag {other:?}"))),
        },
    }
}

/// Older lsblk prints `--bytes` sizes as strings.
fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Size::Number(value)) => Ok(Some(value)),
        Some(Size::Text(value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid lsblk size {value:?}"))),
    }
}

pub(crate) fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>, PlatformError> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(PlatformError::ParseLsblk)?;

    let devices = output
        .blockdevices
        .into_iter()
        .filter(|device| device.kind == "disk")
        .map(|device| {
            let partitions: Vec<Partition> = device
                .children
                .iter()
                .filter(|child| child.kind == "part")
                .map(|child| Partition {
                    path: child.name.clone(),
                    label: child.label.clone(),
                    mount_points: child.nested_mount_points(),
                })
                .collect();
            let usb = device.tran.as_deref() == Some("usb");
            let system = device.nested_mount_points().iter().any(|mount| {
                SYSTEM_MOUNT_POINTS
                    .iter()
                    .any(|system| mount.as_os_str() == *system)
            });
            BlockDevice {
                mount_points: device.mount_points(),
                path: device.name,
                model: device.model.map(|model| model.trim().to_owned()),
                size: device.size,
                removable: device.rm || device.hotplug || usb,
                transport: device.tran,
                system,
                partitions,
            }
        })
        .collect();

    Ok(devices)
}
