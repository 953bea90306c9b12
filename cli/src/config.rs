use anyhow::{bail, Context};
use directories::BaseDirs;
use libfrifetch::CourseTarget;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "~/.frifetch.json";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Conf {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Command printing the password on stdout, e.g. `pass show portal`.
    #[serde(default)]
    pub password_cmd: String,
    #[serde(rename = "RootURL", alias = "RootUrl")]
    pub root_url: String,
    /// Directory each course gets its own sub-directory in.
    pub path: PathBuf,
    /// Course name to course id.
    #[serde(default)]
    pub courses: BTreeMap<String, u64>,
}

/// Replaces a leading `~` with the user's home directory.
pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some(rest) => rest.trim_start_matches(&['/', '\\'][..]),
        None => return Ok(PathBuf::from(path)),
    };
    let base_dirs = BaseDirs::new().context("could not determine the home directory")?;
    Ok(base_dirs.home_dir().join(rest))
}

impl Conf {
    /// Reads and validates the configuration, running the password command if
    /// there is one.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let mut conf = Self::parse(&content)
            .with_context(|| format!("invalid configuration {}", path.display()))?;
        conf.resolve_password()?;
        Ok(conf)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut conf: Conf = serde_json::from_str(content)?;
        conf.root_url = conf.root_url.trim_end_matches('/').to_string();
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.username.is_empty() {
            bail!("Username is not set");
        }
        if self.password.is_empty() && self.password_cmd.trim().is_empty() {
            bail!("neither Password nor PasswordCmd is set");
        }
        if self.path.as_os_str().is_empty() {
            bail!("Path is not set");
        }
        Url::parse(&self.root_url)
            .with_context(|| format!("RootURL {:?} is not a valid url", self.root_url))?;
        Ok(())
    }

    fn resolve_password(&mut self) -> anyhow::Result<()> {
        let mut parts = self.password_cmd.split_whitespace();
        let program = match parts.next() {
            Some(p) => p,
            None => return Ok(()),
        };
        let output = Command::new(program)
            .args(parts)
            .output()
            .with_context(|| format!("failed to run password command {program}"))?;
        if !output.status.success() {
            bail!("password command {} exited with {}", program, output.status);
        }
        let password = String::from_utf8(output.stdout)
            .context("password command printed invalid utf-8")?
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();
        if password.is_empty() {
            bail!("password command {} printed nothing", program);
        }
        self.password = password;
        Ok(())
    }

    /// Courses named on the command line, or all of them when none are. Names
    /// that aren't configured are skipped.
    pub fn select_courses(&self, names: &[String]) -> BTreeMap<String, u64> {
        if names.is_empty() {
            return self.courses.clone();
        }
        let mut selected = BTreeMap::new();
        for name in names {
            match self.courses.get(name) {
                Some(id) => {
                    selected.insert(name.clone(), *id);
                }
                None => tracing::warn!("Course {} is not configured, skipping", name),
            }
        }
        selected
    }

    pub fn course_targets(&self, courses: &BTreeMap<String, u64>) -> Vec<CourseTarget> {
        courses
            .iter()
            .map(|(name, id)| CourseTarget {
                name: name.clone(),
                course_id: *id,
                local_path: self.path.join(name),
            })
            .collect()
    }
}
