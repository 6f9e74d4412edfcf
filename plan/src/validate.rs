use std::path::{Path, PathBuf};

use tracing::debug;
use vcfkit_config::{DeploymentConfig, HostNumber};
use vcfkit_fs as fs;
use vcfkit_operation::ImageSource;
use vcfkit_platform::{BlockDevice, Platform, check_tools, find_device};

use crate::PlanError;

/// ISO 9660 primary volume descriptor identifier, at sector 16 + 1.
const ISO_MAGIC: &[u8] = b"CD001";
const ISO_MAGIC_OFFSET: u64 = 0x8001;

/// The device must be known to the platform, removable, and not host the
/// running system.
pub(crate) async fn check_device(
    platform: &dyn Platform,
    path: &Path,
) -> Result<BlockDevice, PlanError> {
    let Some(device) = find_device(platform, path).await? else {
        let removable = platform
            .list_devices()
            .await?
            .into_iter()
            .filter(|device| device.removable && !device.system)
            .map(|device| device.path.display().to_string())
            .collect::<Vec<_>>();
        return Err(PlanError::DeviceNotFound {
            device: path.to_owned(),
            removable: if removable.is_empty() {
                "none".to_owned()
            } else {
                removable.join(", ")
            },
        });
    };

    if device.system {
        return Err(PlanError::SystemDisk {
            device: device.path,
        });
    }
    if !device.removable {
        return Err(PlanError::DeviceNotRemovable {
            device: device.path,
        });
    }
    debug!(device = %device.describe(), "device accepted");
    Ok(device)
}

/// An ISO file (checked by its volume descriptor) or an extracted tree.
pub(crate) async fn check_image(path: &Path) -> Result<ImageSource, PlanError> {
    if !fs::path_exists(path).await? {
        return Err(PlanError::ImageNotFound(path.to_owned()));
    }
    if fs::is_dir(path).await? {
        let boot_config = path.join("EFI/BOOT/BOOT.CFG");
        if !fs::path_exists(&boot_config).await? {
            return Err(PlanError::ImageMissingBootConfig(boot_config));
        }
        return Ok(ImageSource::Directory(path.to_owned()));
    }
    match fs::read_at(path, ISO_MAGIC_OFFSET, ISO_MAGIC.len()).await? {
        Some(magic) if magic == ISO_MAGIC => Ok(ImageSource::Iso(path.to_owned())),
        _ => Err(PlanError::NotAnIsoImage(path.to_owned())),
    }
}

/// The rendered kickstart for the host, by file-name convention.
pub(crate) async fn check_rendered(
    rendered_dir: &Path,
    host: HostNumber,
) -> Result<PathBuf, PlanError> {
    let path = rendered_dir.join(host.kickstart_file_name());
    if fs::path_exists(&path).await? && fs::is_file(&path).await? {
        Ok(path)
    } else {
        Err(PlanError::RenderedConfigNotFound { host, path })
    }
}

pub(crate) fn check_platform_tools(platform: &dyn Platform) -> Result<(), PlanError> {
    check_tools(platform)?;
    Ok(())
}

/// Extracted rEFInd files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Refind {
    pub efi: PathBuf,
    pub icons: Option<PathBuf>,
}

const REFIND_EFI: &str = "refind_x64.efi";

/// Accepts the `refind_x64.efi` binary itself, the `refind/` directory that
/// holds it, or the top of an extracted `refind-bin-*` archive.
pub(crate) async fn check_refind(path: &Path) -> Result<Refind, PlanError> {
    let candidates = [
        path.to_owned(),
        path.join(REFIND_EFI),
        path.join("refind").join(REFIND_EFI),
    ];
    for efi in candidates {
        if fs::path_exists(&efi).await? && fs::is_file(&efi).await? {
            let icons = match efi.parent() {
                Some(dir) => {
                    let icons = dir.join("icons");
                    if fs::path_exists(&icons).await? && fs::is_dir(&icons).await? {
                        Some(icons)
                    } else {
                        None
                    }
                }
                None => None,
            };
            return Ok(Refind { efi, icons });
        }
    }
    Err(PlanError::RefindNotFound(path.to_owned()))
}

/// Paths in the config file are relative to the config file.
pub(crate) fn config_relative(config: &DeploymentConfig, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        config.dir().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x8800];
        bytes[0x8001..0x8006].copy_from_slice(b"CD001");
        bytes
    }

    #[tokio::test]
    async fn accepts_iso_by_signature() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("esxi.iso");
        std::fs::write(&iso, iso_bytes()).unwrap();

        assert_eq!(check_image(&iso).await.unwrap(), ImageSource::Iso(iso));
    }

    #[tokio::test]
    async fn rejects_non_iso_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("esxi.iso");
        std::fs::write(&file, b"not an iso").unwrap();

        assert!(matches!(
            check_image(&file).await,
            Err(PlanError::NotAnIsoImage(_))
        ));
        assert!(matches!(
            check_image(&dir.path().join("missing.iso")).await,
            Err(PlanError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn accepts_extracted_tree_with_boot_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            check_image(dir.path()).await,
            Err(PlanError::ImageMissingBootConfig(_))
        ));

        std::fs::create_dir_all(dir.path().join("EFI/BOOT")).unwrap();
        std::fs::write(dir.path().join("EFI/BOOT/BOOT.CFG"), "kernelopt=\n").unwrap();
        assert_eq!(
            check_image(dir.path()).await.unwrap(),
            ImageSource::Directory(dir.path().to_owned())
        );
    }

    #[tokio::test]
    async fn finds_refind_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let refind = dir.path().join("refind-bin-0.14.2/refind");
        std::fs::create_dir_all(refind.join("icons")).unwrap();
        std::fs::write(refind.join(REFIND_EFI), b"efi").unwrap();

        let found = check_refind(&dir.path().join("refind-bin-0.14.2"))
            .await
            .unwrap();
        assert_eq!(found.efi, refind.join(REFIND_EFI));
        assert_eq!(found.icons, Some(refind.join("icons")));

        let found = check_refind(&refind.join(REFIND_EFI)).await.unwrap();
        assert_eq!(found.efi, refind.join(REFIND_EFI));

        assert!(matches!(
            check_refind(dir.path()).await,
            Err(PlanError::RefindNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rendered_config_by_convention() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ks-esx02.cfg"), "vmaccepteula\n").unwrap();

        assert_eq!(
            check_rendered(dir.path(), HostNumber::new(2)).await.unwrap(),
            dir.path().join("ks-esx02.cfg")
        );
        assert!(matches!(
            check_rendered(dir.path(), HostNumber::new(1)).await,
            Err(PlanError::RenderedConfigNotFound { .. })
        ));
    }
}
