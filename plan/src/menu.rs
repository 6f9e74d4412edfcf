use std::path::PathBuf;

use tracing::info;
use vcfkit_config::DeploymentConfig;
use vcfkit_operation::{LineEdit, MediaPath, MenuEntry, Operation, Source, refind_config};
use vcfkit_platform::{Platform, VolumeLabel};

use crate::validate::{
    check_device, check_image, check_platform_tools, check_refind, check_rendered,
    config_relative,
};
use crate::{Plan, PlanError, Step, StepName, Target, finalize_step, prepare_steps};

pub const DEFAULT_MENU_LABEL: &str = "VCF";
pub const DEFAULT_IMAGE_DIR: &str = "esx9";

const BOOT_DIR: &str = "EFI/BOOT";
const KICKSTART_DIR: &str = "kickstart";

#[derive(Debug, Clone)]
pub struct MenuOptions {
    pub device: PathBuf,
    /// Falls back to `common.esxi_iso_path`.
    pub image: Option<PathBuf>,
    /// Falls back to `common.refind_path`.
    pub refind: Option<PathBuf>,
    pub label: Option<String>,
    /// Directory on the media the image tree is copied into.
    pub image_dir: Option<String>,
    /// Falls back to the config file's directory.
    pub rendered_dir: Option<PathBuf>,
}

/// Boot menu label for one host.
pub fn menu_title(hostname: &str) -> String {
    format!("ESXi 9.0 - {hostname}")
}

/// Plan a USB installer whose rEFInd menu offers one unattended install per
/// configured host.
pub async fn plan_menu(
    config: &DeploymentConfig,
    platform: &dyn Platform,
    options: MenuOptions,
) -> Result<Plan, PlanError> {
    let MenuOptions {
        device,
        image,
        refind,
        label,
        image_dir,
        rendered_dir,
    } = options;

    let label = VolumeLabel::new(label.as_deref().unwrap_or(DEFAULT_MENU_LABEL))?;
    let image_dir = image_dir.unwrap_or_else(|| DEFAULT_IMAGE_DIR.to_owned());
    if image_dir.is_empty()
        || !image_dir
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PlanError::InvalidImageDir(image_dir));
    }

    let device = check_device(platform, &device).await?;
    let image_path = image
        .or_else(|| {
            config
                .common()
                .esxi_iso_path
                .as_deref()
                .map(|path| config_relative(config, path))
        })
        .ok_or(PlanError::ImagePathMissing)?;
    let image = check_image(&image_path).await?;
    let rendered_dir = rendered_dir.unwrap_or_else(|| config.dir().to_owned());
    let mut rendered = Vec::with_capacity(config.hosts().len());
    for host in config.hosts() {
        rendered.push((host, check_rendered(&rendered_dir, host.number).await?));
    }
    let refind_path = refind
        .or_else(|| {
            config
                .common()
                .refind_path
                .as_deref()
                .map(|path| config_relative(config, path))
        })
        .ok_or(PlanError::RefindPathMissing)?;
    let refind = check_refind(&refind_path).await?;
    check_platform_tools(platform)?;

    let checks = vec![
        format!("device {} is removable", device.describe()),
        format!("image {image}"),
        format!(
            "{} kickstarts in {}",
            rendered.len(),
            rendered_dir.display()
        ),
        format!("rEFInd {}", refind.efi.display()),
        format!("tools available on {}", platform.name()),
    ];

    let boot_dir = MediaPath::new(BOOT_DIR);
    let image_root = MediaPath::new(&image_dir);
    let image_boot_dir = image_root.join(BOOT_DIR);
    let kickstart_dir = MediaPath::new(KICKSTART_DIR);

    let mut steps = prepare_steps(&device, &label);

    steps.push(Step::new(
        StepName::Populate,
        vec![
            Operation::MountDevice {
                device: device.path.clone(),
                label: label.clone(),
            },
            Operation::CreateDir {
                path: boot_dir.clone(),
            },
            Operation::CreateDir {
                path: image_root.clone(),
            },
            Operation::CreateDir {
                path: kickstart_dir.clone(),
            },
            Operation::AttachImage {
                image: image.clone(),
            },
            Operation::CopyTree {
                source: Source::Image(PathBuf::new()),
                destination: image_root.clone(),
            },
            Operation::DetachImage,
        ],
    ));

    let boot_config = image_boot_dir.join("BOOT.CFG");
    steps.push(Step::new(
        StepName::PatchBootConfig,
        vec![Operation::PatchFile {
            path: boot_config.clone(),
            backup: Some(image_boot_dir.join("BOOT.CFG.backup")),
            edits: vec![
                LineEdit::upsert("prefix", format!("/{image_dir}/")),
                LineEdit::strip_leading_slashes("kernel"),
                LineEdit::strip_leading_slashes("modules"),
            ],
        }],
    ));

    let mut host_dirs = Vec::with_capacity(rendered.len() * 2);
    let mut embeds = Vec::with_capacity(rendered.len());
    let mut entries = Vec::with_capacity(rendered.len());
    for (host, kickstart) in &rendered {
        let host_boot_dir = image_root.join(format!("ks{}", host.number)).join("BOOT");
        let embedded = kickstart_dir.join(host.number.embedded_kickstart_name());

        host_dirs.push(Operation::CopyDirFiles {
            source: Source::Media(image_boot_dir.clone()),
            destination: host_boot_dir.clone(),
        });
        host_dirs.push(Operation::PatchFile {
            path: host_boot_dir.join("BOOT.CFG"),
            backup: None,
            edits: vec![LineEdit::set("kernelopt", format!("ks=usb:{embedded}"))],
        });
        embeds.push(Operation::CopyFile {
            source: Source::Host(kickstart.clone()),
            destination: embedded,
        });
        entries.push(MenuEntry {
            title: menu_title(&host.hostname),
            loader: host_boot_dir.join("BOOTX64.EFI").to_string(),
        });
    }
    steps.push(Step::new(StepName::HostBootDirs, host_dirs));
    steps.push(Step::new(StepName::Embed, embeds));

    let mut install = vec![Operation::CopyFile {
        source: Source::Host(refind.efi.clone()),
        destination: boot_dir.join("BOOTX64.EFI"),
    }];
    if let Some(icons) = &refind.icons {
        install.push(Operation::CopyTree {
            source: Source::Host(icons.clone()),
            destination: boot_dir.join("icons"),
        });
    }
    steps.push(Step::new(StepName::InstallBootMenu, install));

    steps.push(Step::new(
        StepName::GenerateMenu,
        vec![Operation::WriteFile {
            path: boot_dir.join("refind.conf"),
            contents: refind_config(&entries).into_bytes(),
        }],
    ));
    steps.push(finalize_step(&device));

    info!(
        hosts = rendered.len(),
        device = %device.path.display(),
        steps = steps.len() + 1,
        "planned boot menu installer"
    );

    Ok(Plan {
        target: Target::Menu {
            hosts: rendered
                .iter()
                .map(|(host, _)| (host.number, host.hostname.clone()))
                .collect(),
        },
        device,
        label,
        image,
        checks,
        steps,
    })
}
