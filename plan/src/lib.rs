mod menu;
mod single;
mod validate;

use std::path::PathBuf;

use displaydoc::Display;
use thiserror::Error;
use vcfkit_config::HostNumber;
use vcfkit_operation::{ImageSource, Operation};
use vcfkit_platform::{BlockDevice, PlatformError, VolumeLabel};
use vcfkit_view::{Render, Tree, TreeBuilder};

pub use crate::menu::{DEFAULT_IMAGE_DIR, DEFAULT_MENU_LABEL, MenuOptions, menu_title, plan_menu};
pub use crate::single::{DEFAULT_SINGLE_LABEL, SingleOptions, plan_single};

#[derive(Debug, Error, Display)]
pub enum PlanError {
    /// host {number} not found in config (available: {available})
    HostNotFound { number: HostNumber, available: String },
    /// device {device} not found (removable devices: {removable})
    DeviceNotFound { device: PathBuf, removable: String },
    /// device {device} is not removable
    DeviceNotRemovable { device: PathBuf },
    /// device {device} hosts the running system
    SystemDisk { device: PathBuf },
    /// no installer image given: pass --iso or set common.esxi_iso_path
    ImagePathMissing,
    /// installer image not found at {0}
    ImageNotFound(PathBuf),
    /// {0} is not an ISO 9660 image
    NotAnIsoImage(PathBuf),
    /// extracted image has no boot config at {0}
    ImageMissingBootConfig(PathBuf),
    /// rendered config for host {host} not found at {path}, run `vcfkit render` first
    RenderedConfigNotFound { host: HostNumber, path: PathBuf },
    /// no rEFInd files given: pass --refind or set common.refind_path
    RefindPathMissing,
    /// refind_x64.efi not found under {0}
    RefindNotFound(PathBuf),
    /// invalid image directory name {0:?}
    InvalidImageDir(String),
    /// {0}
    Platform(#[from] PlatformError),
    /// {0}
    Fs(#[from] vcfkit_fs::FsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StepName {
    /// validate
    Validate,
    /// unmount
    Unmount,
    /// format
    Format,
    /// populate
    Populate,
    /// embed kickstart
    Embed,
    /// patch boot config
    PatchBootConfig,
    /// per-host boot directories
    HostBootDirs,
    /// install boot menu
    InstallBootMenu,
    /// generate boot menu
    GenerateMenu,
    /// finalize
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: StepName,
    pub operations: Vec<Operation>,
}

impl Step {
    fn new(name: StepName, operations: Vec<Operation>) -> Self {
        Self { name, operations }
    }
}

/// What the media will boot into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Installs one host unattended.
    Single { host: HostNumber, hostname: String },
    /// Boot menu with one entry per host.
    Menu { hosts: Vec<(HostNumber, String)> },
}

/// Everything an imaging run will do, decided up front.
///
/// Building a plan only reads: the device inventory, the image, and the
/// rendered configs. The validate step has no operations of its own; its
/// `checks` are what planning verified.
#[derive(Debug, Clone)]
pub struct Plan {
    pub target: Target,
    pub device: BlockDevice,
    pub label: VolumeLabel,
    pub image: ImageSource,
    pub checks: Vec<String>,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.steps.iter().flat_map(|step| step.operations.iter())
    }

    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Steps including validate.
    pub fn step_count(&self) -> usize {
        self.steps.len() + 1
    }
}

impl Render for Plan {
    fn render(&self) -> Tree {
        let title = match &self.target {
            Target::Single { host, hostname } => {
                format!("single-target installer for host {host} ({hostname})")
            }
            Target::Menu { hosts } => {
                format!("boot menu installer for {} hosts", hosts.len())
            }
        };
        let total = self.step_count();

        let mut nodes = Vec::with_capacity(total);
        nodes.push(
            TreeBuilder::default()
                .label(format!("1/{total} {}", StepName::Validate))
                .nodes(self.checks.iter().map(Tree::leaf).collect())
                .build(),
        );
        for (index, step) in self.steps.iter().enumerate() {
            nodes.push(
                TreeBuilder::default()
                    .label(format!("{}/{total} {}", index + 2, step.name))
                    .nodes(
                        step.operations
                            .iter()
                            .map(|operation| Tree::leaf(operation.to_string()))
                            .collect(),
                    )
                    .build(),
            );
        }

        TreeBuilder::default()
            .label(format!(
                "{title} on {} (label {})",
                self.device.describe(),
                self.label
            ))
            .nodes(nodes)
            .build()
    }
}

fn available_hosts(config: &vcfkit_config::DeploymentConfig) -> String {
    config
        .host_numbers()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Steps shared by both kinds of installer.
fn prepare_steps(device: &BlockDevice, label: &VolumeLabel) -> Vec<Step> {
    vec![
        Step::new(
            StepName::Unmount,
            vec![Operation::UnmountDevice {
                device: device.path.clone(),
            }],
        ),
        Step::new(
            StepName::Format,
            vec![Operation::FormatDevice {
                device: device.path.clone(),
                label: label.clone(),
            }],
        ),
    ]
}

fn finalize_step(device: &BlockDevice) -> Step {
    Step::new(
        StepName::Finalize,
        vec![
            Operation::Sync,
            Operation::UnmountMedia,
            Operation::EjectDevice {
                device: device.path.clone(),
            },
        ],
    )
}
