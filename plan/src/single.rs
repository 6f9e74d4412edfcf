use std::path::PathBuf;

use tracing::info;
use vcfkit_config::{DeploymentConfig, HostNumber};
use vcfkit_operation::{LineEdit, MediaPath, Operation, Source};
use vcfkit_platform::{Platform, VolumeLabel};

use crate::validate::{
    check_device, check_image, check_platform_tools, check_rendered, config_relative,
};
use crate::{Plan, PlanError, Step, StepName, Target, available_hosts, finalize_step, prepare_steps};

pub const DEFAULT_SINGLE_LABEL: &str = "ESXI";

/// Where the kickstart lands on single-target media, and what the bootloader
/// is told to load.
const KICKSTART_PATH: &str = "KS.CFG";
const BOOT_CONFIG: &str = "EFI/BOOT/BOOT.CFG";

#[derive(Debug, Clone)]
pub struct SingleOptions {
    pub device: PathBuf,
    pub host: HostNumber,
    /// Falls back to `common.esxi_iso_path`.
    pub image: Option<PathBuf>,
    pub label: Option<String>,
    /// Falls back to the config file's directory.
    pub rendered_dir: Option<PathBuf>,
}

/// Plan a USB installer that installs one host without prompting.
pub async fn plan_single(
    config: &DeploymentConfig,
    platform: &dyn Platform,
    options: SingleOptions,
) -> Result<Plan, PlanError> {
    let SingleOptions {
        device,
        host,
        image,
        label,
        rendered_dir,
    } = options;

    let machine = config.host(host).ok_or_else(|| PlanError::HostNotFound {
        number: host,
        available: available_hosts(config),
    })?;
    let label = VolumeLabel::new(label.as_deref().unwrap_or(DEFAULT_SINGLE_LABEL))?;

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
    let rendered = check_rendered(&rendered_dir, host).await?;
    check_platform_tools(platform)?;

    let checks = vec![
        format!("device {} is removable", device.describe()),
        format!("image {image}"),
        format!("kickstart {}", rendered.display()),
        format!("tools available on {}", platform.name()),
    ];

    let boot_config = MediaPath::new(BOOT_CONFIG);
    let mut steps = prepare_steps(&device, &label);
    steps.extend([
        Step::new(
            StepName::Populate,
            vec![
                Operation::MountDevice {
                    device: device.path.clone(),
                    label: label.clone(),
                },
                Operation::AttachImage {
                    image: image.clone(),
                },
                Operation::CopyTree {
                    source: Source::Image(PathBuf::new()),
                    destination: MediaPath::root(),
                },
                Operation::DetachImage,
            ],
        ),
        Step::new(
            StepName::Embed,
            vec![Operation::CopyFile {
                source: Source::Host(rendered),
                destination: MediaPath::new(KICKSTART_PATH),
            }],
        ),
        Step::new(
            StepName::PatchBootConfig,
            vec![Operation::PatchFile {
                backup: Some(MediaPath::new(format!("{BOOT_CONFIG}.backup"))),
                path: boot_config,
                edits: vec![LineEdit::set(
                    "kernelopt",
                    format!("ks=usb:/{KICKSTART_PATH}"),
                )],
            }],
        ),
        finalize_step(&device),
    ]);

    info!(
        host = %host,
        device = %device.path.display(),
        steps = steps.len() + 1,
        "planned single-target installer"
    );

    Ok(Plan {
        target: Target::Single {
            host,
            hostname: machine.hostname.clone(),
        },
        device,
        label,
        image,
        checks,
        steps,
    })
}
