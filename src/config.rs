use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::worker::{CacheFirstScope, WorkerConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site origin, e.g. https://example.org
  pub origin: String,
  /// Bump to replace the static cache on the next install
  pub version: u32,
  /// Paths precached at install time
  pub assets: Vec<String>,
  /// Served when a page is neither cached nor reachable; must be listed in `assets`
  pub offline_page: String,
  #[serde(default)]
  pub caches: CachesConfig,
  #[serde(default)]
  pub policy: PolicyConfig,
  /// Cache database location (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachesConfig {
  /// Static cache name is `<static_prefix>-v<version>`
  #[serde(default = "default_static_prefix")]
  pub static_prefix: String,
  #[serde(default = "default_views")]
  pub views: String,
}

impl Default for CachesConfig {
  fn default() -> Self {
    Self {
      static_prefix: default_static_prefix(),
      views: default_views(),
    }
  }
}

fn default_static_prefix() -> String {
  "static".to_string()
}

fn default_views() -> String {
  "views".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
  /// `all` (default) or `assets`
  #[serde(default)]
  pub cache_first_scope: CacheFirstScope,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/swcache/config.yaml \
         or pass --config."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Validate and convert into the worker's configuration.
  pub fn worker(&self) -> Result<WorkerConfig> {
    let origin =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if self.assets.is_empty() {
      return Err(eyre!("At least one asset must be listed"));
    }

    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
    };
    let assets = self
      .assets
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;
    if !assets.contains(&resolve(&self.offline_page)?) {
      return Err(eyre!(
        "Offline page {} must be one of the assets",
        self.offline_page
      ));
    }

    let worker = WorkerConfig {
      origin: origin.clone(),
      version: self.version,
      static_prefix: self.caches.static_prefix.clone(),
      views_cache: self.caches.views.clone(),
      assets: self.assets.clone(),
      offline_page: self.offline_page.clone(),
      scope: self.policy.cache_first_scope,
    };
    if worker.static_cache_name() == worker.views_cache {
      return Err(eyre!(
        "Views cache name collides with static cache {}",
        worker.views_cache
      ));
    }

    Ok(worker)
  }

  /// Cache database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
origin: https://blog.test
version: 4
assets:
  - /offline.html
  - /styles.css
offline_page: /offline.html
"#;

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    let worker = config.worker().unwrap();

    assert_eq!(worker.static_cache_name(), "static-v4");
    assert_eq!(worker.views_cache, "views");
    assert_eq!(worker.scope, CacheFirstScope::All);
    assert!(config.database.is_none());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
origin: https://blog.test/
version: 2
assets: [offline.html, styles.css]
offline_page: /offline.html
caches:
  static_prefix: assets
  views: pages
policy:
  cache_first_scope: assets
database: /tmp/swcache-test.db
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let worker = config.worker().unwrap();

    assert_eq!(worker.static_cache_name(), "assets-v2");
    assert_eq!(worker.views_cache, "pages");
    assert_eq!(worker.scope, CacheFirstScope::Assets);
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/swcache-test.db")
    );
  }

  #[test]
  fn test_offline_page_must_be_an_asset() {
    let yaml = MINIMAL.replace("offline_page: /offline.html", "offline_page: /404.html");
    let config = Config::from_yaml(&yaml).unwrap();
    let err = config.worker().unwrap_err();
    assert!(err.to_string().contains("must be one of the assets"));
  }

  #[test]
  fn test_invalid_origin() {
    let yaml = MINIMAL.replace("https://blog.test", "not a url");
    let config = Config::from_yaml(&yaml).unwrap();
    assert!(config.worker().is_err());
  }

  #[test]
  fn test_views_name_collision() {
    let yaml = format!("{}caches:\n  views: static-v4\n", MINIMAL);
    let config = Config::from_yaml(&yaml).unwrap();
    assert!(config.worker().is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    let err = Config::load(Some(Path::new("/nonexistent/swcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swcache.yaml");
    std::fs::write(&path, MINIMAL).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.version, 4);
  }
}
