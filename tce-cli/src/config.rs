//! Collector settings, layered from the command line, the environment, a TOML file and the defaults.

use error::{ErrorKind, Result, ResultExt};
use tce::collector::Config;
use tce::Descriptor;

use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the output directory.
pub const OUTPUT_VAR: &str = "TCE_OUTPUT";
/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_VAR: &str = "TCE_RUNTIME_DIR";
/// Environment variable naming the configuration file.
pub const CONFIG_VAR: &str = "TCE_CONFIG";

/// The content of the TOML configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub listen: Vec<String>,
    pub output: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub line_limit: Option<usize>,
}

impl FileConfig {
    /// Reads a configuration file.
    pub fn open(path: &Path) -> Result<FileConfig> {
        let content = fs::read_to_string(path).chain_err(|| ErrorKind::BadConfig(path.to_owned()))?;
        let config = ::toml::from_str(&content).chain_err(|| ErrorKind::BadConfig(path.to_owned()))?;
        Ok(config)
    }
}

/// Settings given on the command line. `None` and empty lists defer to the lower layers.
#[derive(Debug, Default)]
pub struct Arguments<'a> {
    pub descriptors: Vec<&'a str>,
    pub output: Option<&'a Path>,
    pub runtime_dir: Option<&'a Path>,
    pub line_limit: Option<usize>,
    pub config: Option<&'a Path>,
}

/// The resolved settings of a collector.
#[derive(Debug)]
pub struct Settings {
    pub descriptors: Vec<Descriptor>,
    pub collector: Config,
}

/// Resolves the settings. `env` looks up an environment variable.
///
/// # Errors
///
/// * Returns `BadConfig` if the configuration file cannot be read or parsed.
/// * Returns `NoDescriptors` if no layer names a listener.
/// * Returns `BadDescriptor` if a listener cannot be parsed.
pub fn resolve<F>(args: &Arguments, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let config_path = args.config.map(Path::to_owned).or_else(|| env(CONFIG_VAR).map(PathBuf::from));
    let file = match config_path {
        Some(path) => FileConfig::open(&path)?,
        None => FileConfig::default(),
    };

    let descriptors = if args.descriptors.is_empty() {
        file.listen.iter().map(|s| s.parse()).collect::<::tce::Result<Vec<Descriptor>>>()?
    } else {
        args.descriptors.iter().map(|s| s.parse()).collect::<::tce::Result<Vec<Descriptor>>>()?
    };
    ensure!(!descriptors.is_empty(), ErrorKind::NoDescriptors);

    let mut collector = Config::default();
    if let Some(output) = args
        .output
        .map(Path::to_owned)
        .or_else(|| env(OUTPUT_VAR).map(PathBuf::from))
        .or(file.output)
    {
        collector.output = output;
    }
    if let Some(dir) = args
        .runtime_dir
        .map(Path::to_owned)
        .or_else(|| env(RUNTIME_DIR_VAR).map(PathBuf::from))
        .or(file.runtime_dir)
    {
        collector.runtime_dir = dir;
    }
    if let Some(limit) = args.line_limit.or(file.line_limit) {
        collector.line_limit = limit;
    }

    Ok(Settings { descriptors, collector })
}

/// The runtime directory used by `tce dump`, which must agree with the collector's.
pub fn runtime_dir<F>(arg: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    arg.map(Path::to_owned)
        .or_else(|| env(RUNTIME_DIR_VAR).map(PathBuf::from))
        .unwrap_or_else(|| Config::default().runtime_dir)
}
