mod template;
mod variables;

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::info;
use vcfkit_config::{DeploymentConfig, HostNumber};
use vcfkit_fs::{self as fs, FsError};

pub use crate::template::Template;
pub use crate::variables::template_variables;

/// Template file name looked up next to the config file.
pub const DEFAULT_TEMPLATE_NAME: &str = "ks-template.cfg.j2";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("template file not found at: {0}")]
    TemplateNotFound(PathBuf),

    #[error("failed to read template file {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse template {name}: {message}")]
    TemplateParse { name: String, message: String },

    #[error("host {host}: template placeholder `{placeholder}` has no value")]
    MissingValue {
        placeholder: String,
        host: HostNumber,
    },

    #[error("host {host}: failed to render template: {message}")]
    Render { host: HostNumber, message: String },

    #[error("host {number} not found in config (available: {available})")]
    HostNotFound { number: HostNumber, available: String },

    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Which hosts to render.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostSelector {
    All,
    One(HostNumber),
}

impl FromStr for HostSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(HostSelector::All);
        }
        s.parse::<HostNumber>()
            .map(HostSelector::One)
            .map_err(|_| format!("expected a host number or \"all\", got {s:?}"))
    }
}

impl Display for HostSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HostSelector::All => write!(f, "all"),
            HostSelector::One(number) => write!(f, "{number}"),
        }
    }
}

/// Output of rendering the template for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub number: HostNumber,
    pub hostname: String,
    pub file_name: String,
    pub text: String,
}

pub fn default_template_path(config: &DeploymentConfig) -> PathBuf {
    config.dir().join(DEFAULT_TEMPLATE_NAME)
}

/// Render every selected host in memory. Nothing is written, so a failure on
/// any host leaves the output directory untouched.
pub fn render(
    template: &Template,
    config: &DeploymentConfig,
    selector: HostSelector,
) -> Result<Vec<RenderedConfig>, RenderError> {
    let hosts = match selector {
        HostSelector::All => config.hosts().iter().collect::<Vec<_>>(),
        HostSelector::One(number) => {
            let host = config
                .host(number)
                .ok_or_else(|| RenderError::HostNotFound {
                    number,
                    available: config
                        .host_numbers()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })?;
            vec![host]
        }
    };

    hosts
        .into_iter()
        .map(|host| template.render(config, host))
        .collect()
}

/// Write rendered configs into `output_dir`, each through a temporary file
/// renamed into place.
pub async fn write(
    rendered: &[RenderedConfig],
    output_dir: &Path,
) -> Result<Vec<PathBuf>, RenderError> {
    fs::create_dir(output_dir).await?;

    let mut paths = Vec::with_capacity(rendered.len());
    for config in rendered {
        let path = output_dir.join(&config.file_name);
        fs::write_file_atomic(&path, config.text.as_bytes()).await?;
        info!(
            host = %config.number,
            hostname = %config.hostname,
            path = %path.display(),
            "wrote kickstart"
        );
        paths.push(path);
    }
    Ok(paths)
}
