mod device;
mod linux;
mod macos;

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use vcfkit_cmd::CommandError;
use vcfkit_fs::FsError;

pub use crate::device::{BlockDevice, Partition, VolumeLabel, format_size, print_devices};
pub use crate::linux::Linux;
pub use crate::macos::MacOs;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to parse lsblk output: {0}")]
    ParseLsblk(#[source] serde_json::Error),

    #[error("required tool `{tool}` not found on PATH: {source}")]
    MissingTool {
        tool: &'static str,
        #[source]
        source: which::Error,
    },

    #[error("device {0} is not known to the platform")]
    UnknownDevice(PathBuf),

    #[error("could not determine where {device} was mounted")]
    MountPointNotFound { device: PathBuf },

    #[error("invalid volume label {label:?}: {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("unsupported platform: {os}")]
    Unsupported { os: &'static str },
}

/// Operating-system specific disk handling.
///
/// Everything destructive about imaging goes through here, so the planning
/// and patching logic stays platform independent.
#[async_trait]
pub trait Platform: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Executables which must be on `PATH` before imaging starts.
    fn required_tools(&self) -> &'static [&'static str];

    /// Whole-disk devices, removable or not. Read-only.
    async fn list_devices(&self) -> Result<Vec<BlockDevice>, PlatformError>;

    /// Release every mount of the device and its partitions.
    async fn unmount_device(&self, device: &Path) -> Result<(), PlatformError>;

    /// Write a fresh MBR partition table with a single FAT32 partition.
    async fn format(&self, device: &Path, label: &VolumeLabel) -> Result<(), PlatformError>;

    /// Mount the device's first partition and return the mount point.
    async fn mount(&self, device: &Path, label: &VolumeLabel) -> Result<PathBuf, PlatformError>;

    async fn unmount(&self, mount_point: &Path) -> Result<(), PlatformError>;

    async fn eject(&self, device: &Path) -> Result<(), PlatformError>;

    /// Mount an ISO image read-only and return the mount point.
    async fn attach_image(&self, image: &Path) -> Result<PathBuf, PlatformError>;

    async fn detach_image(&self, mount_point: &Path) -> Result<(), PlatformError>;

    /// Flush filesystem buffers.
    async fn sync(&self) -> Result<(), PlatformError>;
}

/// The platform for the operating system this binary was built for.
pub fn native() -> Result<Box<dyn Platform>, PlatformError> {
    if cfg!(target_os = "linux") {
        Ok(Box::new(Linux::default()))
    } else if cfg!(target_os = "macos") {
        Ok(Box::new(MacOs::default()))
    } else {
        Err(PlatformError::Unsupported {
            os: std::env::consts::OS,
        })
    }
}

/// Look up a device by path, following symlinks such as
/// `/dev/disk/by-id/usb-...`.
pub async fn find_device(
    platform: &dyn Platform,
    path: &Path,
) -> Result<Option<BlockDevice>, PlatformError> {
    let resolved = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_owned());
    let devices = platform.list_devices().await?;
    Ok(devices
        .into_iter()
        .find(|device| device.path == path || device.path == resolved))
}

/// Check that every tool the platform shells out to is installed.
pub fn check_tools(platform: &dyn Platform) -> Result<(), PlatformError> {
    for &tool in platform.required_tools() {
        which::which(tool).map_err(|source| PlatformError::MissingTool { tool, source })?;
    }
    Ok(())
}

/// Directory under the system temp dir used as a mount point.
pub(crate) fn mount_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vcfkit-{name}-{}", std::process::id()))
}
