use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use vcfkit_operation::{ApplyContext, OperationError};
use vcfkit_plan::{Plan, StepName};
use vcfkit_platform::Platform;
use vcfkit_view::Render;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Print the plan and stop.
    pub dry_run: bool,
    /// Skip the interactive confirmation.
    pub assume_yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    DryRun,
    Applied,
}

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("imaging needs root privileges (effective uid {uid}), re-run with sudo or use --dry-run")]
    NotRoot { uid: u32 },

    #[error("step {step} failed: {source}")]
    Step {
        step: StepName,
        #[source]
        source: OperationError,
    },

    #[error("cancelled by user, {device} was not changed")]
    Cancelled { device: String },

    #[error("failed to write to stdout: {0}")]
    WriteStdout(#[source] tokio::io::Error),

    #[error("failed to read confirmation from stdin: {0}")]
    ReadStdin(#[source] tokio::io::Error),
}

/// Print the plan, then unless this is a dry run, confirm and execute it.
///
/// A dry run makes no platform calls at all.
pub async fn apply(
    plan: &Plan,
    platform: &dyn Platform,
    options: ApplyOptions,
) -> Result<Outcome, ApplyError> {
    let ApplyOptions {
        dry_run,
        assume_yes,
    } = options;

    write_stdout(&format!("{}\n", plan.render())).await?;

    if dry_run {
        info!("dry run, nothing was changed");
        return Ok(Outcome::DryRun);
    }

    require_root()?;

    if !assume_yes {
        confirm(plan).await?;
    }

    execute(plan, platform).await?;
    Ok(Outcome::Applied)
}

/// Perform every operation of the plan in order, stopping at the first
/// failure.
pub async fn execute(plan: &Plan, platform: &dyn Platform) -> Result<(), ApplyError> {
    let total = plan.step_count();
    let mut ctx = ApplyContext::new(platform);

    info!(step = 1, total, "{}: passed", StepName::Validate);
    for (index, step) in plan.steps.iter().enumerate() {
        info!(step = index + 2, total, "{}", step.name);
        for operation in &step.operations {
            if let Err(source) = operation.apply(&mut ctx).await {
                ctx.release().await;
                return Err(ApplyError::Step {
                    step: step.name,
                    source,
                });
            }
        }
    }

    info!(
        device = %plan.device.path.display(),
        operations = plan.operations().count(),
        "installer media ready"
    );
    Ok(())
}

fn require_root() -> Result<(), ApplyError> {
    let uid = nix::unistd::geteuid();
    debug!(uid = uid.as_raw(), "effective user");
    if uid.is_root() {
        Ok(())
    } else {
        Err(ApplyError::NotRoot { uid: uid.as_raw() })
    }
}

async fn confirm(plan: &Plan) -> Result<(), ApplyError> {
    write_stdout(&format!(
        "\nAll data on {} will be erased.\nType 'yes' to continue: ",
        plan.device.describe()
    ))
    .await?;

    read_confirmation(&mut BufReader::new(tokio::io::stdin()), plan).await
}

/// Anything but `yes` cancels, including end of input.
async fn read_confirmation<R>(input: &mut R, plan: &Plan) -> Result<(), ApplyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .await
        .map_err(ApplyError::ReadStdin)?;
    if is_yes(&answer) {
        Ok(())
    } else {
        info!("cancelled");
        Err(ApplyError::Cancelled {
            device: plan.device.path.display().to_string(),
        })
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

async fn write_stdout(text: &str) -> Result<(), ApplyError> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(text.as_bytes())
        .await
        .map_err(ApplyError::WriteStdout)?;
    stdout.flush().await.map_err(ApplyError::WriteStdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vcfkit_config::{ConfigFormat, DeploymentConfig, HostNumber};
    use vcfkit_plan::{MenuOptions, SingleOptions, plan_menu, plan_single};
    use vcfkit_platform::{BlockDevice, PlatformError, VolumeLabel};

    use super::*;

    const CONFIG: &str = r#"
network:
  gateway: 192.168.10.1
  vlan_id: 10
  dns_server: 192.168.10.2
common:
  root_password: VMware1!VMware1!
  ntp_server: pool.ntp.org
  esxi_iso_path: esxi.iso
  refind_path: refind-bin-0.14.2
hosts:
  - number: 1
    hostname: esx01.lab.local
    ip: 192.168.10.10
    install_disk: t10.NVMe____990_PRO_1
    tiering_disk: t10.NVMe____980_PRO_1
  - number: 2
    hostname: esx02.lab.local
    ip: 192.168.10.11
    install_disk: t10.NVMe____990_PRO_2
    tiering_disk: t10.NVMe____980_PRO_2
  - number: 3
    hostname: esx03.lab.local
    ip: 192.168.10.12
    install_disk: t10.NVMe____990_PRO_3
    tiering_disk: t10.NVMe____980_PRO_3
"#;

    const BOOT_CFG: &str = "\
bootstate=0
title=Loading ESXi installer
timeout=5
prefix=
kernel=/b.b00
kernelopt=runweasel cdromBoot
modules=/jumpstrt.gz --- /useropts.gz --- /k.b00
build=9.0.0-0.0.24755229
updated=0
";

    /// Records every platform call. The media and the attached image are
    /// directories under a temp dir.
    #[derive(Debug)]
    struct Recorder {
        root: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(root: &Path) -> Self {
            Self {
                root: root.to_owned(),
                calls: Mutex::new(vec![]),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn media(&self) -> PathBuf {
            self.root.join("media")
        }
    }

    #[async_trait]
    impl Platform for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn required_tools(&self) -> &'static [&'static str] {
            &[]
        }
        async fn list_devices(&self) -> Result<Vec<BlockDevice>, PlatformError> {
            Ok(vec![BlockDevice {
                path: PathBuf::from("/dev/sdz"),
                model: Some("Ultra Fit".to_owned()),
                size: Some(32_015_679_488),
                removable: true,
                transport: Some("usb".to_owned()),
                system: false,
                mount_points: vec![],
                partitions: vec![],
            }])
        }
        async fn unmount_device(&self, device: &Path) -> Result<(), PlatformError> {
            self.record(format!("unmount_device {}", device.display()));
            Ok(())
        }
        async fn format(&self, device: &Path, label: &VolumeLabel) -> Result<(), PlatformError> {
            self.record(format!("format {} {label}", device.display()));
            std::fs::create_dir_all(self.media()).unwrap();
            Ok(())
        }
        async fn mount(&self, device: &Path, _: &VolumeLabel) -> Result<PathBuf, PlatformError> {
            self.record(format!("mount {}", device.display()));
            Ok(self.media())
        }
        async fn unmount(&self, _: &Path) -> Result<(), PlatformError> {
            self.record("unmount".to_owned());
            Ok(())
        }
        async fn eject(&self, device: &Path) -> Result<(), PlatformError> {
            self.record(format!("eject {}", device.display()));
            Ok(())
        }
        async fn attach_image(&self, _: &Path) -> Result<PathBuf, PlatformError> {
            self.record("attach_image".to_owned());
            Ok(self.root.join("iso-contents"))
        }
        async fn detach_image(&self, _: &Path) -> Result<(), PlatformError> {
            self.record("detach_image".to_owned());
            Ok(())
        }
        async fn sync(&self) -> Result<(), PlatformError> {
            self.record("sync".to_owned());
            Ok(())
        }
    }

    fn write(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Config, rendered kickstarts, an ISO, its extracted contents and rEFInd.
    fn lab(dir: &Path) -> DeploymentConfig {
        let config_path = dir.join("vcf-config.yaml");
        write(&config_path, CONFIG.as_bytes());
        for n in 1..=3 {
            write(
                &dir.join(format!("ks-esx0{n}.cfg")),
                format!("vmaccepteula\nnetwork --hostname=esx0{n}.lab.local\n").as_bytes(),
            );
        }

        let mut iso = vec![0u8; 0x8800];
        iso[0x8001..0x8006].copy_from_slice(b"CD001");
        write(&dir.join("esxi.iso"), &iso);

        let contents = dir.join("iso-contents");
        write(&contents.join("BOOT.CFG"), BOOT_CFG.as_bytes());
        write(&contents.join("EFI/BOOT/BOOT.CFG"), BOOT_CFG.as_bytes());
        write(&contents.join("EFI/BOOT/BOOTX64.EFI"), b"esxi efi");
        write(&contents.join("B.B00"), b"kernel");

        let refind = dir.join("refind-bin-0.14.2/refind");
        write(&refind.join("refind_x64.efi"), b"refind efi");
        write(&refind.join("icons/os_vmware.png"), b"png");

        DeploymentConfig::parse(CONFIG, ConfigFormat::Yaml, &config_path).unwrap()
    }

    fn single_options(host: u32) -> SingleOptions {
        SingleOptions {
            device: PathBuf::from("/dev/sdz"),
            host: HostNumber::new(host),
            image: None,
            label: None,
            rendered_dir: None,
        }
    }

    fn menu_options() -> MenuOptions {
        MenuOptions {
            device: PathBuf::from("/dev/sdz"),
            image: None,
            refind: None,
            label: None,
            image_dir: None,
            rendered_dir: None,
        }
    }

    #[tokio::test]
    async fn dry_run_makes_no_platform_calls() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        let platform = Recorder::new(dir.path());

        let plan = plan_single(&config, &platform, single_options(1)).await.unwrap();
        let outcome = apply(
            &plan,
            &platform,
            ApplyOptions {
                dry_run: true,
                assume_yes: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::DryRun);
        assert!(platform.calls().is_empty());
        assert!(!platform.media().exists());

        let plan = plan_menu(&config, &platform, menu_options()).await.unwrap();
        apply(
            &plan,
            &platform,
            ApplyOptions {
                dry_run: true,
                assume_yes: true,
            },
        )
        .await
        .unwrap();
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn validation_fails_the_same_in_both_modes() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        std::fs::remove_file(dir.path().join("ks-esx02.cfg")).unwrap();
        let platform = Recorder::new(dir.path());

        let mut messages = Vec::new();
        for dry_run in [true, false] {
            let result = match plan_single(&config, &platform, single_options(2)).await {
                Ok(plan) => apply(
                    &plan,
                    &platform,
                    ApplyOptions {
                        dry_run,
                        assume_yes: true,
                    },
                )
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            messages.push(result.unwrap_err());
        }

        assert_eq!(messages[0], messages[1]);
        assert!(messages[0].contains("ks-esx02.cfg"));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn single_target_patches_only_kernelopt() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        let platform = Recorder::new(dir.path());

        let plan = plan_single(&config, &platform, single_options(2)).await.unwrap();
        execute(&plan, &platform).await.unwrap();

        let media = platform.media();
        assert_eq!(
            std::fs::read_to_string(media.join("KS.CFG")).unwrap(),
            "vmaccepteula\nnetwork --hostname=esx02.lab.local\n"
        );
        assert_eq!(
            std::fs::read_to_string(media.join("EFI/BOOT/BOOT.CFG.backup")).unwrap(),
            BOOT_CFG
        );
        let patched = std::fs::read_to_string(media.join("EFI/BOOT/BOOT.CFG")).unwrap();
        let changed: Vec<(&str, &str)> = BOOT_CFG
            .lines()
            .zip(patched.lines())
            .filter(|(before, after)| before != after)
            .collect();
        assert_eq!(
            changed,
            [("kernelopt=runweasel cdromBoot", "kernelopt=ks=usb:/KS.CFG")]
        );
        assert_eq!(BOOT_CFG.len() - "runweasel cdromBoot".len() + "ks=usb:/KS.CFG".len(), patched.len());
        assert!(media.join("B.B00").is_file());

        assert_eq!(
            platform.calls(),
            [
                "unmount_device /dev/sdz",
                "format /dev/sdz ESXI",
                "mount /dev/sdz",
                "attach_image",
                "detach_image",
                "sync",
                "unmount",
                "eject /dev/sdz",
            ]
        );
    }

    #[tokio::test]
    async fn menu_installer_has_one_entry_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        let platform = Recorder::new(dir.path());

        let plan = plan_menu(&config, &platform, menu_options()).await.unwrap();
        execute(&plan, &platform).await.unwrap();

        let media = platform.media();
        assert_eq!(
            std::fs::read(media.join("EFI/BOOT/BOOTX64.EFI")).unwrap(),
            b"refind efi"
        );
        assert!(media.join("EFI/BOOT/icons/os_vmware.png").is_file());
        assert!(media.join("esx9/EFI/BOOT/BOOT.CFG.backup").is_file());

        let main = std::fs::read_to_string(media.join("esx9/EFI/BOOT/BOOT.CFG")).unwrap();
        assert!(main.contains("\nprefix=/esx9/\n"));
        assert!(main.contains("\nkernel=b.b00\n"));
        assert!(main.contains("\nmodules=jumpstrt.gz --- useropts.gz --- k.b00\n"));

        for n in 1..=3 {
            let boot = std::fs::read_to_string(media.join(format!("esx9/ks{n}/BOOT/BOOT.CFG")))
                .unwrap();
            assert!(boot.contains(&format!("\nkernelopt=ks=usb:/kickstart/KS-ESX0{n}.CFG\n")));
            assert!(boot.contains("\nprefix=/esx9/\n"));
            assert!(media.join(format!("esx9/ks{n}/BOOT/BOOTX64.EFI")).is_file());
            assert_eq!(
                std::fs::read_to_string(media.join(format!("kickstart/KS-ESX0{n}.CFG"))).unwrap(),
                format!("vmaccepteula\nnetwork --hostname=esx0{n}.lab.local\n")
            );
        }

        let menu = std::fs::read_to_string(media.join("EFI/BOOT/refind.conf")).unwrap();
        let entries: Vec<&str> = menu
            .lines()
            .filter(|line| line.starts_with("menuentry"))
            .collect();
        assert_eq!(
            entries,
            [
                "menuentry \"ESXi 9.0 - esx01.lab.local\" {",
                "menuentry \"ESXi 9.0 - esx02.lab.local\" {",
                "menuentry \"ESXi 9.0 - esx03.lab.local\" {",
            ]
        );
        assert!(platform.calls().contains(&"format /dev/sdz VCF".to_owned()));
    }

    #[tokio::test]
    async fn failure_names_the_step_and_releases_media() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        std::fs::write(
            dir.path().join("iso-contents/EFI/BOOT/BOOT.CFG"),
            "title=no kernel options\n",
        )
        .unwrap();
        let platform = Recorder::new(dir.path());

        let plan = plan_single(&config, &platform, single_options(1)).await.unwrap();
        let err = execute(&plan, &platform).await.unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Step {
                step: StepName::PatchBootConfig,
                ..
            }
        ));
        assert!(err.to_string().starts_with("step patch boot config failed"));
        let calls = platform.calls();
        assert_eq!(calls.last().map(String::as_str), Some("unmount"));
        assert!(!calls.iter().any(|call| call.starts_with("eject")));
    }

    #[tokio::test]
    async fn anything_but_yes_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let config = lab(dir.path());
        let platform = Recorder::new(dir.path());
        let plan = plan_single(&config, &platform, single_options(1)).await.unwrap();

        read_confirmation(&mut &b"yes\n"[..], &plan).await.unwrap();

        for answer in [&b""[..], &b"no\n"[..], &b"y\n"[..]] {
            let err = read_confirmation(&mut &answer[..], &plan).await.unwrap_err();
            assert!(matches!(err, ApplyError::Cancelled { ref device } if device == "/dev/sdz"));
        }
        assert_eq!(
            ApplyError::Cancelled {
                device: "/dev/sdz".to_owned()
            }
            .to_string(),
            "cancelled by user, /dev/sdz was not changed"
        );
        assert!(!platform.calls().iter().any(|call| call.starts_with("format")));
    }

    #[test]
    fn confirmation_needs_yes() {
        assert!(is_yes("yes\n"));
        assert!(is_yes("  YES "));
        assert!(!is_yes("y\n"));
        assert!(!is_yes(""));
    }
}
