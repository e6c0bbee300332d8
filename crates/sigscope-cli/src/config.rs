use std::path::Path;
use std::{fs, path::PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use sigscope::{sig::MAX_INSTRUCTIONS, Bitness};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // This is not part of the config, but rather used
    // at runtime to remember where to save to
    #[serde(skip)]
    path: PathBuf,

    pub log: Log,
    pub scan: Scan,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    /// configure logger level
    pub level: String,
    /// whether to display log targets
    pub targets: bool,
    /// also write logs to `sigscope.log` in the data dir
    pub file: bool,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            targets: false,
            file: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Scan {
    /// decoder mode when the image doesn't decide it, `32` or `64`
    pub bitness: String,
    /// instructions a generated signature may span
    pub max_instructions: usize,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            bitness: Bitness::default().to_string(),
            max_instructions: MAX_INSTRUCTIONS,
        }
    }
}

impl Scan {
    pub fn bitness(&self) -> Result<Bitness> {
        self.bitness
            .parse()
            .wrap_err_with(|| format!("scan.bitness must be 32 or 64, got `{}`", self.bitness))
    }
}

impl Config {
    /// Load a config file
    /// If path doesn't exist, creates and saves default config
    /// otherwise loads what's already there
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // if path doesn't exist, create default config,
        // save it, and return it
        if !path.exists() {
            let config = Self {
                path: path.to_owned(),
                ..Default::default()
            };

            config.save()?;
            return Ok(config);
        }

        let data = fs::read_to_string(path)?;
        let mut config = toml::from_str::<Self>(&data)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;

        path.clone_into(&mut config.path);

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let serialized = toml::to_string_pretty(self)?;
        fs::write(&self.path, serialized)?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
