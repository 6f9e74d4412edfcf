mod boot;
mod menu;

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use vcfkit_fs::{self as fs, FsError};
use vcfkit_platform::{Platform, PlatformError, VolumeLabel};

pub use crate::boot::{LineEdit, PatchError, patch_boot_config};
pub use crate::menu::{MenuEntry, refind_config};

/// A path on the installer media, relative to the root of its filesystem.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MediaPath(PathBuf);

impl MediaPath {
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    pub fn new(value: impl Into<PathBuf>) -> Self {
        Self(value.into())
    }

    pub fn join(&self, path: impl AsRef<Path>) -> Self {
        Self(self.0.join(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl Display for MediaPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.display())
    }
}

/// Where the installer image tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// An ISO 9660 file, attached read-only while populating.
    Iso(PathBuf),
    /// An already extracted image tree.
    Directory(PathBuf),
}

impl Display for ImageSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Iso(path) => write!(f, "Iso({})", path.display()),
            ImageSource::Directory(path) => write!(f, "Directory({})", path.display()),
        }
    }
}

/// Where a copy reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A path on the machine running the imager.
    Host(PathBuf),
    /// A path inside the attached image, relative to its root.
    Image(PathBuf),
    /// A path on the installer media.
    Media(MediaPath),
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Source::Host(path) => write!(f, "{}", path.display()),
            Source::Image(path) => write!(f, "image:/{}", path.display()),
            Source::Media(path) => write!(f, "media:{path}"),
        }
    }
}

/// One concrete imaging action.
///
/// Operations are plain data: planning builds them without touching the
/// device, and they are only performed through [`Operation::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    UnmountDevice {
        device: PathBuf,
    },
    FormatDevice {
        device: PathBuf,
        label: VolumeLabel,
    },
    MountDevice {
        device: PathBuf,
        label: VolumeLabel,
    },
    AttachImage {
        image: ImageSource,
    },
    CreateDir {
        path: MediaPath,
    },
    CopyTree {
        source: Source,
        destination: MediaPath,
    },
    CopyFile {
        source: Source,
        destination: MediaPath,
    },
    /// Copy the regular files directly inside `source`, without recursing.
    CopyDirFiles {
        source: Source,
        destination: MediaPath,
    },
    WriteFile {
        path: MediaPath,
        contents: Vec<u8>,
    },
    PatchFile {
        path: MediaPath,
        backup: Option<MediaPath>,
        edits: Vec<LineEdit>,
    },
    DetachImage,
    Sync,
    UnmountMedia,
    EjectDevice {
        device: PathBuf,
    },
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operation::UnmountDevice { device } => {
                write!(f, "Device::Unmount(device = {})", device.display())
            }
            Operation::FormatDevice { device, label } => write!(
                f,
                "Device::Format(device = {}, table = mbr, filesystem = fat32, label = {})",
                device.display(),
                label
            ),
            Operation::MountDevice { device, label } => write!(
                f,
                "Media::Mount(device = {}, label = {})",
                device.display(),
                label
            ),
            Operation::AttachImage { image } => write!(f, "Image::Attach(source = {image})"),
            Operation::CreateDir { path } => write!(f, "File::CreateDirectory(path = {path})"),
            Operation::CopyTree {
                source,
                destination,
            } => write!(
                f,
                "File::CopyTree(source = {source}, destination = {destination})"
            ),
            Operation::CopyFile {
                source,
                destination,
            } => write!(
                f,
                "File::CopyFile(source = {source}, destination = {destination})"
            ),
            Operation::CopyDirFiles {
                source,
                destination,
            } => write!(
                f,
                "File::CopyDirFiles(source = {source}, destination = {destination})"
            ),
            Operation::WriteFile { path, contents } => write!(
                f,
                "File::WriteFile(path = {path}, source = Contents({} bytes))",
                contents.len()
            ),
            Operation::PatchFile {
                path,
                backup,
                edits,
            } => {
                let edits = edits
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                match backup {
                    Some(backup) => write!(
                        f,
                        "File::Patch(path = {path}, backup = {backup}, edits = [{edits}])"
                    ),
                    None => write!(f, "File::Patch(path = {path}, edits = [{edits}])"),
                }
            }
            Operation::DetachImage => write!(f, "Image::Detach"),
            Operation::Sync => write!(f, "Device::Sync"),
            Operation::UnmountMedia => write!(f, "Media::Unmount"),
            Operation::EjectDevice { device } => {
                write!(f, "Device::Eject(device = {})", device.display())
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to patch {path}: {source}")]
    Patch {
        path: MediaPath,
        #[source]
        source: PatchError,
    },

    #[error("installer media is not mounted")]
    MediaNotMounted,

    #[error("no installer image is attached")]
    ImageNotAttached,
}

#[derive(Debug)]
struct AttachedImage {
    root: PathBuf,
    /// Mounted by us, so needs detaching.
    mounted: bool,
}

/// State carried between operations while applying a plan: the platform and
/// where the media and image currently live.
#[derive(Debug)]
pub struct ApplyContext<'a> {
    platform: &'a dyn Platform,
    media: Option<PathBuf>,
    image: Option<AttachedImage>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        Self {
            platform,
            media: None,
            image: None,
        }
    }

    pub fn media_root(&self) -> Option<&Path> {
        self.media.as_deref()
    }

    fn media(&self) -> Result<&Path, OperationError> {
        self.media_root().ok_or(OperationError::MediaNotMounted)
    }

    fn resolve(&self, source: &Source) -> Result<PathBuf, OperationError> {
        match source {
            Source::Host(path) => Ok(path.clone()),
            Source::Image(path) => self
                .image
                .as_ref()
                .map(|image| image.root.join(path))
                .ok_or(OperationError::ImageNotAttached),
            Source::Media(path) => Ok(path.resolve(self.media()?)),
        }
    }

    /// Best-effort release of anything still attached or mounted, after a
    /// failed run.
    pub async fn release(&mut self) {
        if let Some(image) = self.image.take() {
            if image.mounted {
                if let Err(err) = self.platform.detach_image(&image.root).await {
                    warn!("failed to detach image at {}: {err}", image.root.display());
                }
            }
        }
        if let Some(root) = self.media.take() {
            if let Err(err) = self.platform.unmount(&root).await {
                warn!("failed to unmount media at {}: {err}", root.display());
            }
        }
    }
}

impl Operation {
    pub async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), OperationError> {
        info!("{self}");
        match self {
            Operation::UnmountDevice { device } => {
                ctx.platform.unmount_device(device).await?;
            }
            Operation::FormatDevice { device, label } => {
                ctx.platform.format(device, label).await?;
            }
            Operation::MountDevice { device, label } => {
                let root = ctx.platform.mount(device, label).await?;
                debug!(root = %root.display(), "media mounted");
                ctx.media = Some(root);
            }
            Operation::AttachImage { image } => {
                let attached = match image {
                    ImageSource::Iso(path) => AttachedImage {
                        root: ctx.platform.attach_image(path).await?,
                        mounted: true,
                    },
                    ImageSource::Directory(path) => AttachedImage {
                        root: path.clone(),
                        mounted: false,
                    },
                };
                debug!(root = %attached.root.display(), "image available");
                ctx.image = Some(attached);
            }
            Operation::CreateDir { path } => {
                fs::create_dir(path.resolve(ctx.media()?)).await?;
            }
            Operation::CopyTree {
                source,
                destination,
            } => {
                let from = ctx.resolve(source)?;
                let to = destination.resolve(ctx.media()?);
                let count = fs::copy_dir(&from, &to).await?;
                info!(count, "copied {} to {destination}", from.display());
            }
            Operation::CopyFile {
                source,
                destination,
            } => {
                let from = ctx.resolve(source)?;
                let to = destination.resolve(ctx.media()?);
                if let Some(parent) = to.parent() {
                    fs::create_dir(parent).await?;
                }
                fs::copy_file(&from, &to).await?;
            }
            Operation::CopyDirFiles {
                source,
                destination,
            } => {
                let from = ctx.resolve(source)?;
                let to = destination.resolve(ctx.media()?);
                let count = fs::copy_dir_files(&from, &to).await?;
                debug!(count, "copied files into {destination}");
            }
            Operation::WriteFile { path, contents } => {
                let file = path.resolve(ctx.media()?);
                if let Some(parent) = file.parent() {
                    fs::create_dir(parent).await?;
                }
                fs::write_file(&file, contents).await?;
            }
            Operation::PatchFile {
                path,
                backup,
                edits,
            } => {
                let media = ctx.media()?;
                let file = path.resolve(media);
                let content = fs::read_file_to_string(&file).await?;
                let patched =
                    patch_boot_config(&content, edits).map_err(|source| OperationError::Patch {
                        path: path.clone(),
                        source,
                    })?;
                if let Some(backup) = backup {
                    fs::copy_file(&file, backup.resolve(media)).await?;
                }
                fs::write_file(&file, patched.as_bytes()).await?;
            }
            Operation::DetachImage => {
                if let Some(image) = ctx.image.take() {
                    if image.mounted {
                        ctx.platform.detach_image(&image.root).await?;
                    }
                }
            }
            Operation::Sync => {
                ctx.platform.sync().await?;
            }
            Operation::UnmountMedia => {
                if let Some(root) = ctx.media.take() {
                    ctx.platform.unmount(&root).await?;
                }
            }
            Operation::EjectDevice { device } => {
                ctx.platform.eject(device).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::sync::Mutex;
    use vcfkit_platform::BlockDevice;

    /// Platform whose media and image are plain directories.
    #[derive(Debug)]
    struct DirPlatform {
        media: PathBuf,
        image: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    impl DirPlatform {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }
    }

    #[async_trait]
    impl Platform for DirPlatform {
        fn name(&self) -> &'static str {
            "dir"
        }
        fn required_tools(&self) -> &'static [&'static str] {
            &[]
        }
        async fn list_devices(&self) -> Result<Vec<BlockDevice>, PlatformError> {
            Ok(vec![])
        }
        async fn unmount_device(&self, _device: &Path) -> Result<(), PlatformError> {
            self.record("unmount_device");
            Ok(())
        }
        async fn format(&self, _device: &Path, _label: &VolumeLabel) -> Result<(), PlatformError> {
            self.record("format");
            Ok(())
        }
        async fn mount(&self, _device: &Path, _label: &VolumeLabel) -> Result<PathBuf, PlatformError> {
            self.record("mount");
            Ok(self.media.clone())
        }
        async fn unmount(&self, _mount_point: &Path) -> Result<(), PlatformError> {
            self.record("unmount");
            Ok(())
        }
        async fn eject(&self, _device: &Path) -> Result<(), PlatformError> {
            self.record("eject");
            Ok(())
        }
        async fn attach_image(&self, _image: &Path) -> Result<PathBuf, PlatformError> {
            self.record("attach_image");
            Ok(self.image.clone())
        }
        async fn detach_image(&self, _mount_point: &Path) -> Result<(), PlatformError> {
            self.record("detach_image");
            Ok(())
        }
        async fn sync(&self) -> Result<(), PlatformError> {
            self.record("sync");
            Ok(())
        }
    }

    fn label() -> VolumeLabel {
        VolumeLabel::new("ESXI").unwrap()
    }

    #[test]
    fn media_paths_display_from_root() {
        assert_eq!(MediaPath::root().to_string(), "/");
        assert_eq!(
            MediaPath::new("EFI/BOOT").join("BOOT.CFG").to_string(),
            "/EFI/BOOT/BOOT.CFG"
        );
    }

    #[test]
    fn displays_operations() {
        let op = Operation::CopyFile {
            source: Source::Host(PathBuf::from("config/ks-esx01.cfg")),
            destination: MediaPath::new("KS.CFG"),
        };
        assert_eq!(
            op.to_string(),
            "File::CopyFile(source = config/ks-esx01.cfg, destination = /KS.CFG)"
        );
        let op = Operation::PatchFile {
            path: MediaPath::new("EFI/BOOT/BOOT.CFG"),
            backup: Some(MediaPath::new("EFI/BOOT/BOOT.CFG.backup")),
            edits: vec![LineEdit::set("kernelopt", "ks=usb:/KS.CFG")],
        };
        assert_eq!(
            op.to_string(),
            "File::Patch(path = /EFI/BOOT/BOOT.CFG, backup = /EFI/BOOT/BOOT.CFG.backup, edits = [kernelopt=ks=usb:/KS.CFG])"
        );
    }

    #[tokio::test]
    async fn file_operations_need_mounted_media() {
        let dir = tempfile::tempdir().unwrap();
        let platform = DirPlatform {
            media: dir.path().join("media"),
            image: dir.path().join("image"),
            calls: Mutex::new(vec![]),
        };
        let mut ctx = ApplyContext::new(&platform);

        let err = Operation::CreateDir {
            path: MediaPath::new("kickstart"),
        }
        .apply(&mut ctx)
        .await
        .unwrap_err();
        assert!(matches!(err, OperationError::MediaNotMounted));
    }

    #[tokio::test]
    async fn populates_and_patches_media() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        std::fs::create_dir_all(image.join("EFI/BOOT")).unwrap();
        std::fs::write(image.join("EFI/BOOT/BOOT.CFG"), "kernel=/b.b00\nkernelopt=runweasel\n")
            .unwrap();
        std::fs::write(image.join("EFI/BOOT/BOOTX64.EFI"), b"efi").unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir_all(&media).unwrap();

        let platform = DirPlatform {
            media: media.clone(),
            image,
            calls: Mutex::new(vec![]),
        };
        let mut ctx = ApplyContext::new(&platform);
        let operations = [
            Operation::MountDevice {
                device: PathBuf::from("/dev/sdz"),
                label: label(),
            },
            Operation::AttachImage {
                image: ImageSource::Iso(PathBuf::from("esxi.iso")),
            },
            Operation::CopyTree {
                source: Source::Image(PathBuf::new()),
                destination: MediaPath::root(),
            },
            Operation::DetachImage,
            Operation::PatchFile {
                path: MediaPath::new("EFI/BOOT/BOOT.CFG"),
                backup: Some(MediaPath::new("EFI/BOOT/BOOT.CFG.backup")),
                edits: vec![LineEdit::set("kernelopt", "ks=usb:/KS.CFG")],
            },
            Operation::CopyDirFiles {
                source: Source::Media(MediaPath::new("EFI/BOOT")),
                destination: MediaPath::new("ks1/BOOT"),
            },
            Operation::WriteFile {
                path: MediaPath::new("EFI/BOOT/refind.conf"),
                contents: b"timeout 40\n".to_vec(),
            },
            Operation::UnmountMedia,
        ];
        for operation in &operations {
            operation.apply(&mut ctx).await.unwrap();
        }

        assert_eq!(
            std::fs::read_to_string(media.join("EFI/BOOT/BOOT.CFG")).unwrap(),
            "kernel=/b.b00\nkernelopt=ks=usb:/KS.CFG\n"
        );
        assert_eq!(
            std::fs::read_to_string(media.join("EFI/BOOT/BOOT.CFG.backup")).unwrap(),
            "kernel=/b.b00\nkernelopt=runweasel\n"
        );
        assert!(media.join("ks1/BOOT/BOOTX64.EFI").is_file());
        assert!(media.join("ks1/BOOT/BOOT.CFG").is_file());
        assert!(media.join("EFI/BOOT/refind.conf").is_file());
        assert!(ctx.media_root().is_none());
        assert_eq!(
            *platform.calls.lock().unwrap(),
            ["mount", "attach_image", "detach_image", "unmount"]
        );
    }

    #[tokio::test]
    async fn failed_patch_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().to_path_buf();
        std::fs::write(media.join("BOOT.CFG"), "title=ESXi\n").unwrap();
        let platform = DirPlatform {
            media: media.clone(),
            image: media.clone(),
            calls: Mutex::new(vec![]),
        };
        let mut ctx = ApplyContext::new(&platform);
        Operation::MountDevice {
            device: PathBuf::from("/dev/sdz"),
            label: label(),
        }
        .apply(&mut ctx)
        .await
        .unwrap();

        let err = Operation::PatchFile {
            path: MediaPath::new("BOOT.CFG"),
            backup: Some(MediaPath::new("BOOT.CFG.backup")),
            edits: vec![LineEdit::set("kernelopt", "ks=usb:/KS.CFG")],
        }
        .apply(&mut ctx)
        .await
        .unwrap_err();

        assert!(matches!(err, OperationError::Patch { .. }));
        assert_eq!(
            std::fs::read_to_string(media.join("BOOT.CFG")).unwrap(),
            "title=ESXi\n"
        );
        assert!(!media.join("BOOT.CFG.backup").exists());

        ctx.release().await;
        assert_eq!(*platform.calls.lock().unwrap(), ["mount", "unmount"]);
    }
}
