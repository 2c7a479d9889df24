//! Resolved errloop home: configuration plus absolute paths.
//!
//! Every component takes its file locations from [`Paths`]; nothing resolves
//! paths from ambient process state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::config::{CONFIG_FILE, Config, DEFAULT_CONFIG_TOML, PathsConfig};
use crate::ledger::Ledger;
use crate::matcher::MatchEngine;
use crate::model::{Allowlist, DocFormat, RulePack};
use crate::packs::{self, ActiveRuleset, CUSTOM_PACK, MergeReport};

/// Absolute locations of every store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub home: PathBuf,
    pub config: PathBuf,
    pub ledger: PathBuf,
    pub packs_dir: PathBuf,
    pub active: PathBuf,
    pub allowlist: PathBuf,
    pub curated_log: PathBuf,
    pub log_file: PathBuf,
}

impl Paths {
    #[must_use]
    pub fn resolve(home: &Path, config_path: &Path, paths: &PathsConfig) -> Self {
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                home.join(p)
            }
        };
        Self {
            home: home.to_path_buf(),
            config: config_path.to_path_buf(),
            ledger: join(&paths.ledger),
            packs_dir: join(&paths.packs_dir),
            active: join(&paths.active),
            allowlist: join(&paths.allowlist),
            curated_log: join(&paths.curated_log),
            log_file: join(&paths.log_file),
        }
    }

    #[must_use]
    pub fn learned_pack(&self) -> PathBuf {
        packs::learned_pack_path(&self.packs_dir)
    }

    #[must_use]
    pub fn custom_pack(&self) -> PathBuf {
        self.packs_dir.join(format!("{CUSTOM_PACK}.json"))
    }
}

/// Default errloop home: the platform data directory, else `./.errloop`.
#[must_use]
pub fn default_home() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".errloop"), |dir| dir.join("errloop"))
}

/// Loaded configuration and resolved paths.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub config: Config,
    pub paths: Paths,
}

impl Workspace {
    /// Load the workspace rooted at `home`. `config_path` overrides
    /// `<home>/config.toml`.
    pub fn load(home: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path.map_or_else(|| home.join(CONFIG_FILE), Path::to_path_buf);
        let config = Config::load(&config_path)?;
        Ok(Self::with_config(home, &config_path, config))
    }

    #[must_use]
    pub fn with_config(home: &Path, config_path: &Path, config: Config) -> Self {
        let paths = Paths::resolve(home, config_path, &config.paths);
        Self { config, paths }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    #[must_use]
    pub fn ledger(&self) -> Ledger {
        Ledger::new(&self.paths.ledger).with_lock_timeout(self.lock_timeout())
    }

    /// Read the allowlist; a missing file is empty.
    pub fn load_allowlist(&self) -> Result<Allowlist> {
        let content = match std::fs::read_to_string(&self.paths.allowlist) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Allowlist::default()),
            Err(e) => return Err(e.into()),
        };
        let format = DocFormat::from_path(&self.paths.allowlist).unwrap_or(DocFormat::Json);
        let (allowlist, skipped) = Allowlist::parse(&content, format)?;
        if skipped > 0 {
            tracing::warn!(skipped, path = %self.paths.allowlist.display(), "Skipped allowlist entries");
        }
        Ok(allowlist)
    }

    /// The active ruleset: `active.json` when present, otherwise merged in
    /// memory from the enabled packs.
    pub fn active_ruleset(&self) -> Result<ActiveRuleset> {
        if self.paths.active.is_file() {
            return packs::load_active(&self.paths.active);
        }
        let (active, _) =
            packs::build_active(&self.paths.packs_dir, &self.config.enabled_packs, Utc::now());
        Ok(active)
    }

    /// Match engine over the active ruleset and allowlist.
    pub fn engine(&self) -> Result<MatchEngine> {
        let active = self.active_ruleset()?;
        let allowlist = self.load_allowlist()?;
        Ok(MatchEngine::new(active.patterns, &allowlist))
    }

    /// Re-merge enabled packs and atomically rewrite `active.json`.
    #[tracing::instrument(skip(self), fields(home = %self.paths.home.display()))]
    pub fn rebuild_active(&self, now: DateTime<Utc>) -> Result<(ActiveRuleset, MergeReport)> {
        let (active, report) =
            packs::build_active(&self.paths.packs_dir, &self.config.enabled_packs, now);
        packs::write_active(&self.paths.active, &active, self.lock_timeout())?;
        Ok((active, report))
    }

    /// Create starter files that do not exist yet. Returns the files written.
    pub fn init(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        std::fs::create_dir_all(&self.paths.home)?;
        std::fs::create_dir_all(&self.paths.packs_dir)?;
        if let Some(parent) = self.paths.ledger.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !self.paths.config.exists() {
            std::fs::write(&self.paths.config, DEFAULT_CONFIG_TOML)?;
            written.push(self.paths.config.clone());
        }

        let custom = self.paths.custom_pack();
        if !custom.exists() {
            let pack = RulePack::new(CUSTOM_PACK, "Your own rules; these override every other pack");
            packs::save_pack(&custom, &pack, self.lock_timeout())?;
            written.push(custom);
        }

        if !self.paths.allowlist.exists() {
            let bytes = serde_json::to_vec_pretty(&Allowlist::default())?;
            crate::lock::rewrite_atomic(
                &self.paths.allowlist,
                &bytes,
                "allowlist-init",
                self.lock_timeout(),
            )?;
            written.push(self.paths.allowlist.clone());
        }

        Ok(written)
    }
}
