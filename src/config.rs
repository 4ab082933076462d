//! Runtime configuration.
//!
//! A [`Config`] is built once at startup, from the environment and optional
//! `.env` / `local.env` files, and handed to each component's constructor.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `HASH_METHOD` | `phash` |
//! | `HASH_SIZE` | `8` |
//! | `HIGHFREQ_FACTOR` | `4` |
//! | `SIMILARITY_THRESHOLD` | `5` |
//! | `DB_PATH` | `image_fingerprints.db` |
//! | `STORAGE_BACKEND` | `local` (`local` or `oss`) |
//! | `LOCAL_STORAGE_PATH` | `resources/storage` |
//! | `OSS_ACCESS_KEY`, `OSS_SECRET_KEY`, `OSS_BUCKET_NAME` | required for `oss` |
//! | `OSS_ENDPOINT` | `https://oss-cn-hangzhou.aliyuncs.com` |
//! | `OSS_URL_EXPIRES` | `3600` (seconds) |
//! | `OSS_PATH_STYLE` | `false` (`true` puts the bucket in the path, for self-hosted endpoints) |

use crate::core::hash::{HashAlgorithm, HashSettings};
use secrecy::SecretString;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;
pub const DEFAULT_DB_PATH: &str = "image_fingerprints.db";
pub const DEFAULT_LOCAL_STORAGE_PATH: &str = "resources/storage";
pub const DEFAULT_OSS_ENDPOINT: &str = "https://oss-cn-hangzhou.aliyuncs.com";
pub const DEFAULT_URL_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when STORAGE_BACKEND=oss")]
    Missing(&'static str),
}

/// Credentials and location of an OSS bucket.
#[derive(Debug, Clone)]
pub struct OssSettings {
    pub access_key: String,
    pub secret_key: SecretString,
    pub endpoint: String,
    pub bucket: String,
    /// Lifetime of signed URLs handed out for private buckets.
    pub url_expiry: Duration,
    /// Address objects as `{endpoint}/{bucket}/{key}` rather than
    /// `{bucket}.{endpoint}/{key}`.
    pub path_style: bool,
}

#[derive(Debug, Clone)]
pub enum StorageSettings {
    Local { base_path: PathBuf },
    Oss(OssSettings),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hash: HashSettings,
    pub similarity_threshold: u32,
    pub db_path: PathBuf,
    pub storage: StorageSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash: HashSettings::default(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            storage: StorageSettings::Local {
                base_path: PathBuf::from(DEFAULT_LOCAL_STORAGE_PATH),
            },
        }
    }
}

impl Config {
    /// Load from the process environment. `local.env` and then `.env` are read
    /// first if present; neither overrides a variable that is already set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::from_filename("local.env");
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source, falling back to defaults for
    /// anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = HashSettings::default();
        let hash = HashSettings {
            algorithm: parse_var(&lookup, "HASH_METHOD", defaults.algorithm)?,
            hash_size: parse_var(&lookup, "HASH_SIZE", defaults.hash_size)?,
            highfreq_factor: parse_var(&lookup, "HIGHFREQ_FACTOR", defaults.highfreq_factor)?,
        };
        hash.validate().map_err(|e| ConfigError::Invalid {
            var: "HASH_SIZE/HIGHFREQ_FACTOR",
            value: format!("{}/{}", hash.hash_size, hash.highfreq_factor),
            reason: e.to_string(),
        })?;

        let similarity_threshold = parse_var(
            &lookup,
            "SIMILARITY_THRESHOLD",
            DEFAULT_SIMILARITY_THRESHOLD,
        )?;
        let db_path = lookup("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let backend = lookup("STORAGE_BACKEND").unwrap_or_else(|| "local".to_string());
        let storage = match backend.trim().to_ascii_lowercase().as_str() {
            "local" => StorageSettings::Local {
                base_path: lookup("LOCAL_STORAGE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_STORAGE_PATH)),
            },
            "oss" => {
                let required = |var: &'static str| {
                    lookup(var)
                        .filter(|v| !v.trim().is_empty())
                        .ok_or(ConfigError::Missing(var))
                };
                StorageSettings::Oss(OssSettings {
                    access_key: required("OSS_ACCESS_KEY")?,
                    secret_key: SecretString::from(required("OSS_SECRET_KEY")?),
                    endpoint: lookup("OSS_ENDPOINT")
                        .unwrap_or_else(|| DEFAULT_OSS_ENDPOINT.to_string()),
                    bucket: required("OSS_BUCKET_NAME")?,
                    url_expiry: Duration::from_secs(parse_var(
                        &lookup,
                        "OSS_URL_EXPIRES",
                        DEFAULT_URL_EXPIRY.as_secs(),
                    )?),
                    path_style: parse_var(&lookup, "OSS_PATH_STYLE", false)?,
                })
            }
            _ => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    value: backend,
                    reason: "expected `local` or `oss`".to_string(),
                });
            }
        };

        Ok(Self {
            hash,
            similarity_threshold,
            db_path,
            storage,
        })
    }

    pub fn primary_algorithm(&self) -> HashAlgorithm {
        self.hash.algorithm
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.hash, HashSettings::default());
        assert_eq!(config.similarity_threshold, 5);
        assert_eq!(config.db_path, PathBuf::from("image_fingerprints.db"));
        assert!(matches!(
            config.storage,
            StorageSettings::Local { ref base_path } if base_path == &PathBuf::from("resources/storage")
        ));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("HASH_METHOD", "dhash"),
            ("HASH_SIZE", "16"),
            ("SIMILARITY_THRESHOLD", "10"),
            ("DB_PATH", "/tmp/fp.db"),
            ("LOCAL_STORAGE_PATH", "/srv/blobs"),
        ]))
        .unwrap();

        assert_eq!(config.primary_algorithm(), HashAlgorithm::DHash);
        assert_eq!(config.hash.hash_size, 16);
        assert_eq!(config.similarity_threshold, 10);
        assert_eq!(config.db_path, PathBuf::from("/tmp/fp.db"));
    }

    #[test]
    fn test_oss_backend() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORAGE_BACKEND", "oss"),
            ("OSS_ACCESS_KEY", "ak"),
            ("OSS_SECRET_KEY", "sk"),
            ("OSS_BUCKET_NAME", "bucket"),
            ("OSS_URL_EXPIRES", "600"),
        ]))
        .unwrap();

        let StorageSettings::Oss(oss) = config.storage else {
            panic!("expected oss settings");
        };
        assert_eq!(oss.access_key, "ak");
        assert_eq!(oss.secret_key.expose_secret(), "sk");
        assert_eq!(oss.endpoint, DEFAULT_OSS_ENDPOINT);
        assert_eq!(oss.url_expiry, Duration::from_secs(600));
        assert!(!oss.path_style);
    }

    #[test]
    fn test_oss_path_style() {
        let base = [
            ("STORAGE_BACKEND", "oss"),
            ("OSS_ACCESS_KEY", "ak"),
            ("OSS_SECRET_KEY", "sk"),
            ("OSS_BUCKET_NAME", "bucket"),
        ];

        let config = Config::from_lookup(lookup_from(
            &[base.as_slice(), &[("OSS_PATH_STYLE", "true")]].concat(),
        ))
        .unwrap();
        assert!(matches!(config.storage, StorageSettings::Oss(ref oss) if oss.path_style));

        let result = Config::from_lookup(lookup_from(
            &[base.as_slice(), &[("OSS_PATH_STYLE", "sometimes")]].concat(),
        ));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { var: "OSS_PATH_STYLE", .. })
        ));
    }

    #[test]
    fn test_oss_requires_credentials() {
        let result = Config::from_lookup(lookup_from(&[
            ("STORAGE_BACKEND", "oss"),
            ("OSS_ACCESS_KEY", "ak"),
            ("OSS_BUCKET_NAME", "bucket"),
        ]));
        assert!(matches!(result, Err(ConfigError::Missing("OSS_SECRET_KEY"))));
    }

    #[test]
    fn test_invalid_values() {
        for (var, value) in [
            ("HASH_METHOD", "whash"),
            ("HASH_SIZE", "eight"),
            ("HASH_SIZE", "1"),
            ("SIMILARITY_THRESHOLD", "-1"),
            ("STORAGE_BACKEND", "ftp"),
        ] {
            let result = Config::from_lookup(lookup_from(&[(var, value)]));
            assert!(
                matches!(result, Err(ConfigError::Invalid { .. })),
                "{var}={value}"
            );
        }
    }
}
