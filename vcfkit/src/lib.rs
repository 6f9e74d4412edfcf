use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;
use vcfkit_apply::{ApplyError, ApplyOptions, Outcome, apply};
use vcfkit_config::{ConfigError, DEFAULT_CONFIG_PATH, DeploymentConfig, HostNumber};
use vcfkit_plan::{
    MenuOptions, Plan, PlanError, SingleOptions, Target, menu_title, plan_menu, plan_single,
};
use vcfkit_platform::{PlatformError, native, print_devices};
use vcfkit_render::{
    HostSelector, RenderError, RenderedConfig, Template, default_template_path,
};

#[derive(Parser, Debug)]
#[command(
    name = "vcfkit",
    version,
    about = "Kickstart rendering and ESXi USB installer imaging for VCF home labs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Deployment config (YAML, or TOML by extension)
    #[arg(
        long = "config",
        global = true,
        env = "VCFKIT_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config_path: PathBuf,

    #[arg(long = "log", global = true, default_value = "info")]
    pub log: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect configured hosts
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },
    /// Inspect block devices
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },
    /// Render per-host kickstart files from the template
    Render {
        /// Host number, or "all"
        #[arg(default_value = "all")]
        selector: HostSelector,

        /// Template path, defaults to ks-template.cfg.j2 next to the config
        #[arg(long = "template")]
        template: Option<PathBuf>,

        /// Defaults to the config file's directory
        #[arg(long = "output-dir")]
        output_dir: Option<PathBuf>,

        /// Print rendered files instead of writing them
        #[arg(long = "preview")]
        preview: bool,
    },
    /// Write a bootable ESXi installer to a USB device
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostsCommand {
    /// List hosts from the deployment config
    List,
}

#[derive(Subcommand, Debug)]
pub enum DevicesCommand {
    /// List block devices, marking removable and system disks
    List,
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// Installer that installs one host unattended
    Single {
        /// USB device, e.g. /dev/sdb or /dev/disk4
        device: PathBuf,

        /// Host number
        host: HostNumber,

        #[command(flatten)]
        image: ImageArgs,
    },
    /// Installer with a rEFInd menu offering every host
    Menu {
        /// USB device, e.g. /dev/sdb or /dev/disk4
        device: PathBuf,

        /// Extracted rEFInd directory or refind_x64.efi, defaults to
        /// common.refind_path
        #[arg(long = "refind")]
        refind: Option<PathBuf>,

        /// Directory on the device to copy the image into
        #[arg(long = "image-dir")]
        image_dir: Option<String>,

        #[command(flatten)]
        image: ImageArgs,
    },
}

#[derive(clap::Args, Debug)]
pub struct ImageArgs {
    /// ESXi ISO or extracted image directory, defaults to common.esxi_iso_path
    #[arg(long = "iso")]
    pub iso: Option<PathBuf>,

    /// FAT volume label
    #[arg(long = "label")]
    pub label: Option<String>,

    /// Where rendered kickstarts are, defaults to the config file's directory
    #[arg(long = "rendered-dir")]
    pub rendered_dir: Option<PathBuf>,

    /// Print the plan without touching the device
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Do not ask for confirmation
    #[arg(long = "yes", short = 'y')]
    pub yes: bool,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("step validate failed: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("failed to write to stdout: {0}")]
    Stdout(#[source] io::Error),
}

pub async fn get_config(cli: &Cli) -> Result<DeploymentConfig, AppError> {
    info!(path = %cli.config_path.display(), "using config");
    let config = DeploymentConfig::load(&cli.config_path).await?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Hosts { command } => match command {
            HostsCommand::List => cmd_hosts_list(get_config(&cli).await?).await,
        },
        Command::Devices { command } => match command {
            DevicesCommand::List => cmd_devices_list().await,
        },
        Command::Render {
            selector,
            template,
            output_dir,
            preview,
        } => {
            let config = get_config(&cli).await?;
            cmd_render(
                config,
                *selector,
                template.clone(),
                output_dir.clone(),
                *preview,
            )
            .await
        }
        Command::Image { command } => {
            let config = get_config(&cli).await?;
            match command {
                ImageCommand::Single {
                    device,
                    host,
                    image,
                } => cmd_image_single(config, device.clone(), *host, image).await,
                ImageCommand::Menu {
                    device,
                    refind,
                    image_dir,
                    image,
                } => {
                    cmd_image_menu(
                        config,
                        device.clone(),
                        refind.clone(),
                        image_dir.clone(),
                        image,
                    )
                    .await
                }
            }
        }
    }
}

async fn cmd_hosts_list(config: DeploymentConfig) -> Result<(), AppError> {
    config.print_hosts();
    Ok(())
}

async fn cmd_devices_list() -> Result<(), AppError> {
    let platform = native()?;
    let devices = platform.list_devices().await?;
    print_devices(&devices);
    Ok(())
}

async fn cmd_render(
    config: DeploymentConfig,
    selector: HostSelector,
    template: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    preview: bool,
) -> Result<(), AppError> {
    let template_path = template.unwrap_or_else(|| default_template_path(&config));
    info!(path = %template_path.display(), "using template");
    let template = Template::load(&template_path).await?;

    let rendered = vcfkit_render::render(&template, &config, selector)?;
    info!(template = template.name(), hosts = rendered.len(), "rendered");

    if preview {
        return write_preview(&mut io::stdout().lock(), &rendered).map_err(AppError::Stdout);
    }

    let output_dir = output_dir.unwrap_or_else(|| config.dir().to_owned());
    let paths = vcfkit_render::write(&rendered, &output_dir).await?;
    println!(
        "Rendered {} kickstart file(s) into {}",
        paths.len(),
        output_dir.display()
    );
    for (path, config) in paths.iter().zip(&rendered) {
        println!("  {} -> {}", config.hostname, path.display());
    }
    println!();
    print!("{}", config.summary());
    println!();
    println!("Review the generated configs before installing, especially:");
    println!("  - NVMe device identifiers (run 'vdq -q' on the ESXi console)");
    println!("  - Network settings (IP, VLAN, gateway, DNS)");
    println!("  - Root password");
    Ok(())
}

/// Preview output is exactly the bytes `write` would put on disk, so it can
/// be redirected into a file. File names go to the log.
fn write_preview(out: &mut impl Write, rendered: &[RenderedConfig]) -> io::Result<()> {
    for config in rendered {
        info!(
            host = %config.number,
            hostname = %config.hostname,
            file = %config.file_name,
            "preview"
        );
        out.write_all(config.text.as_bytes())?;
    }
    out.flush()
}

async fn cmd_image_single(
    config: DeploymentConfig,
    device: PathBuf,
    host: HostNumber,
    args: &ImageArgs,
) -> Result<(), AppError> {
    let platform = native()?;
    let options = SingleOptions {
        device,
        host,
        image: args.iso.clone(),
        label: args.label.clone(),
        rendered_dir: args.rendered_dir.clone(),
    };
    let plan = plan_single(&config, platform.as_ref(), options).await?;
    let outcome = apply(&plan, platform.as_ref(), apply_options(args)).await?;
    print_summary(&plan, outcome);
    Ok(())
}

async fn cmd_image_menu(
    config: DeploymentConfig,
    device: PathBuf,
    refind: Option<PathBuf>,
    image_dir: Option<String>,
    args: &ImageArgs,
) -> Result<(), AppError> {
    let platform = native()?;
    let options = MenuOptions {
        device,
        image: args.iso.clone(),
        refind,
        label: args.label.clone(),
        image_dir,
        rendered_dir: args.rendered_dir.clone(),
    };
    let plan = plan_menu(&config, platform.as_ref(), options).await?;
    let outcome = apply(&plan, platform.as_ref(), apply_options(args)).await?;
    print_summary(&plan, outcome);
    Ok(())
}

fn apply_options(args: &ImageArgs) -> ApplyOptions {
    ApplyOptions {
        dry_run: args.dry_run,
        assume_yes: args.yes,
    }
}

fn print_summary(plan: &Plan, outcome: Outcome) {
    match outcome {
        Outcome::DryRun => {
            println!("Dry run: no changes were made to {}.", plan.device.path.display());
        }
        Outcome::Applied => {
            println!();
            println!("Installer written to {}", plan.device.describe());
            println!("Volume label: {}", plan.label);
            match &plan.target {
                Target::Single { host, hostname } => {
                    println!("Boots straight into the unattended install of host {host} ({hostname}).");
                }
                Target::Menu { hosts } => {
                    println!("Boot menu entries:");
                    for (number, hostname) in hosts {
                        println!("  {number}. {}", menu_title(hostname));
                    }
                }
            }
            println!("The device has been ejected and can be removed.");
        }
    }
}
