use serde::{Deserialize, Serialize};

use crate::types::{KvError, Result, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Configuration supplied when creating or opening a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Page size in bytes; a power of two between 64 bytes and 64 KiB.
    pub page_size: usize,
    /// Whether tree pages carry a CRC32 in their header.
    pub checksums: bool,
    /// Occupancy, in percent of one page, below which a node is merged or
    /// redistributed with a sibling after a delete.
    pub rebalance_percent: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: 4096,
            checksums: false,
            rebalance_percent: 40,
        }
    }
}

impl Options {
    /// Sets the page size.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Enables or disables page checksums.
    pub fn checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    /// Sets the rebalance threshold.
    pub fn rebalance_percent(mut self, percent: u8) -> Self {
        self.rebalance_percent = percent;
        self
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let opts: Self = toml::from_str(src).map_err(|err| KvError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| KvError::Config(err.to_string()))
    }

    /// Rejects page sizes and thresholds the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(KvError::Invalid("page size must be a power of two in [64, 65536]"));
        }
        if self.rebalance_percent > 100 {
            return Err(KvError::Invalid("rebalance percent above 100"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = Options::default();
        opts.validate().unwrap();
        assert_eq!(opts.page_size, 4096);
        assert_eq!(opts.rebalance_percent, 40);
    }

    #[test]
    fn toml_overrides_and_roundtrips() {
        let opts = Options::from_toml_str("page_size = 512\nchecksums = true\n").unwrap();
        assert_eq!(opts, Options::default().page_size(512).checksums(true));
        let text = opts.to_toml_string().unwrap();
        assert_eq!(Options::from_toml_str(&text).unwrap(), opts);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Options::default().page_size(1000).validate().is_err());
        assert!(Options::default().page_size(32).validate().is_err());
        assert!(Options::default().rebalance_percent(101).validate().is_err());
        assert!(matches!(
            Options::from_toml_str("page_size = \"big\""),
            Err(KvError::Config(_))
        ));
        assert!(matches!(
            Options::from_toml_str("bogus = 1"),
            Err(KvError::Config(_))
        ));
    }
}
