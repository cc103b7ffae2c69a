//! Environment and database configuration.
//!
//! Plain data plus a builder, per the "reject half-constructed state" design
//! note (spec §9): callers assemble a config and hand it to
//! `Environment::create`/`open`, never a partially-initialized environment.

use crate::error::{Error, ErrorCode, Result};
use crate::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::DbFlags;

/// Maximum number of database slots in the header page's index-data array.
pub const DEFAULT_MAX_DATABASES: u16 = 16;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub page_size: u32,
    pub max_databases: u16,
    pub flags: DbFlags,
    pub cache_size_bytes: u64,
    pub journal_size_limit: i64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            page_size: DEFAULT_PAGE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            flags: DbFlags::empty(),
            cache_size_bytes: 2 * 1024 * 1024,
            journal_size_limit: 1024 * 1024,
        }
    }
}

impl EnvConfig {
    pub fn builder() -> EnvConfigBuilder {
        EnvConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::new(ErrorCode::InvPagesize));
        }
        if self.max_databases == 0 {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvConfigBuilder {
    inner: EnvConfigOpt,
}

#[derive(Debug, Clone, Default)]
struct EnvConfigOpt {
    page_size: Option<u32>,
    max_databases: Option<u16>,
    flags: DbFlags,
    cache_size_bytes: Option<u64>,
    journal_size_limit: Option<i64>,
}

impl EnvConfigBuilder {
    pub fn page_size(mut self, size: u32) -> Self {
        self.inner.page_size = Some(size);
        self
    }

    pub fn max_databases(mut self, n: u16) -> Self {
        self.inner.max_databases = Some(n);
        self
    }

    pub fn flags(mut self, flags: DbFlags) -> Self {
        self.inner.flags = flags;
        self
    }

    pub fn cache_size_bytes(mut self, bytes: u64) -> Self {
        self.inner.cache_size_bytes = Some(bytes);
        self
    }

    pub fn journal_size_limit(mut self, limit: i64) -> Self {
        self.inner.journal_size_limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<EnvConfig> {
        let defaults = EnvConfig::default();
        let config = EnvConfig {
            page_size: self.inner.page_size.unwrap_or(defaults.page_size),
            max_databases: self.inner.max_databases.unwrap_or(defaults.max_databases),
            flags: self.inner.flags,
            cache_size_bytes: self
                .inner
                .cache_size_bytes
                .unwrap_or(defaults.cache_size_bytes),
            journal_size_limit: self
                .inner
                .journal_size_limit
                .unwrap_or(defaults.journal_size_limit),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub name: u16,
    pub key_size: u16,
    pub flags: DbFlags,
}

impl DbConfig {
    pub fn validate(&self, usable_page_size: u32) -> Result<()> {
        if self.key_size == 0 {
            return Err(Error::new(ErrorCode::InvKeysize));
        }
        // Keep at least a handful of keys per node; mirrors the backend's
        // `maxkeys*keysize + header <= usable_pagesize` rule (spec §4.7).
        if (self.key_size as u32) * 4 > usable_page_size {
            return Err(Error::new(ErrorCode::InvKeysize));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EnvConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let cfg = EnvConfig::builder().page_size(1000).build();
        assert!(cfg.is_err());
    }

    #[test]
    fn rejects_too_small_page_size() {
        let cfg = EnvConfig::builder().page_size(128).build();
        assert!(cfg.is_err());
    }
}
