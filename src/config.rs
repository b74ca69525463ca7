//! Configuration for opening a database.

use crate::error::{Error, Result};
use std::time::Duration;

const MIN_PAGE_SIZE: usize = 512;
const MAX_PAGE_SIZE: usize = 64 * 1024;
const DEFAULT_REGION_SIZE: u64 = 1024 * 1024 * 1024;

/// Options for [`Database::open_with_config`](crate::Database::open_with_config).
#[derive(Debug, Clone)]
pub struct Config {
    /// Page size for newly created files. Existing files keep the page size
    /// recorded in their header.
    pub page_size: usize,
    /// Size of the memory-mapped region. This is also the upper bound of the
    /// database file; allocating past it fails with `DatabaseFull`.
    pub region_size: u64,
    /// Flush data pages and the header to disk on every commit.
    pub fsync_enabled: bool,
    /// Upper bound on how long `begin_write` waits for the previous writer.
    pub write_lock_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: page_size::get(),
            region_size: DEFAULT_REGION_SIZE,
            fsync_enabled: true,
            write_lock_timeout: None,
        }
    }
}

impl Config {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_region_size(mut self, region_size: u64) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_fsync(mut self, enabled: bool) -> Self {
        self.fsync_enabled = enabled;
        self
    }

    pub fn with_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.write_lock_timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(Error::InvalidConfig(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.region_size < 4 * self.page_size as u64 {
            return Err(Error::InvalidConfig(format!(
                "region of {} bytes cannot hold four {} byte pages",
                self.region_size, self.page_size
            )));
        }
        Ok(())
    }
}
