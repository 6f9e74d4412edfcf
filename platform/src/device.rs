use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use comfy_table::Table;

use crate::PlatformError;

/// Longest volume label a FAT filesystem can hold.
const MAX_LABEL_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    pub label: Option<String>,
    pub mount_points: Vec<PathBuf>,
}

/// A whole-disk block device as reported by the platform inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub model: Option<String>,
    pub size: Option<u64>,
    pub removable: bool,
    pub transport: Option<String>,
    /// Hosts the running operating system.
    pub system: bool,
    pub mount_points: Vec<PathBuf>,
    pub partitions: Vec<Partition>,
}

impl BlockDevice {
    /// Every mount point of the disk itself or any of its partitions.
    pub fn all_mount_points(&self) -> impl Iterator<Item = &Path> {
        self.mount_points
            .iter()
            .chain(self.partitions.iter().flat_map(|p| p.mount_points.iter()))
            .map(PathBuf::as_path)
    }

    pub fn describe(&self) -> String {
        let model = self.model.as_deref().unwrap_or("unknown model");
        match self.size {
            Some(size) => format!("{} ({model}, {})", self.path.display(), format_size(size)),
            None => format!("{} ({model})", self.path.display()),
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn print_devices(devices: &[BlockDevice]) {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(vec![
            "device",
            "model",
            "size",
            "transport",
            "removable",
            "system",
            "mounted",
        ]);

    for device in devices {
        let mounts = device
            .all_mount_points()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            device.path.display().to_string(),
            device.model.clone().unwrap_or_default(),
            device.size.map(format_size).unwrap_or_default(),
            device.transport.clone().unwrap_or_default(),
            yes_no(device.removable).to_owned(),
            yes_no(device.system).to_owned(),
            mounts,
        ]);
    }

    println!("{table}")
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// FAT volume label: upper-case ASCII, at most 11 characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLabel(String);

impl VolumeLabel {
    pub fn new(value: &str) -> Result<Self, PlatformError> {
        let label = value.to_ascii_uppercase();
        let invalid = |reason: &str| PlatformError::InvalidLabel {
            label: value.to_owned(),
            reason: reason.to_owned(),
        };
        if label.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("must be at most 11 characters"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("only letters, digits, '_' and '-' are allowed"));
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VolumeLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
