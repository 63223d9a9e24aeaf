/// Database configuration.
///
/// All options have working defaults; `DbOptions::default()` opens a plain
/// 8 KiB-page database with WAL and auto-checkpoint enabled.

pub const DEFAULT_PAGE_SIZE: u32 = 8192;
pub const MIN_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_EXPANSION_PAGES: u32 = 32;
pub const DEFAULT_WAL_CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_CACHE_PAGES: usize = 256;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Environment variable overriding the page cache capacity.
pub const CACHE_PAGES_ENV: &str = "GALDRDB_CACHE_PAGES";

#[derive(Debug, Clone)]
pub struct EncryptionOptions {
    pub password: String,
    pub kdf_iterations: u32,
}

impl EncryptionOptions {
    pub fn new(password: impl Into<String>) -> Self {
        EncryptionOptions {
            password: password.into(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    pub fn kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DbOptions {
    pub page_size: u32,
    pub use_wal: bool,
    pub use_mmap: bool,
    pub auto_checkpoint: bool,
    pub wal_autocheckpoint_threshold_bytes: u64,
    pub expansion_page_count: u32,
    pub cache_pages: usize,
    pub encryption: Option<EncryptionOptions>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            page_size: DEFAULT_PAGE_SIZE,
            use_wal: true,
            use_mmap: false,
            auto_checkpoint: true,
            wal_autocheckpoint_threshold_bytes: DEFAULT_WAL_CHECKPOINT_BYTES,
            expansion_page_count: DEFAULT_EXPANSION_PAGES,
            cache_pages: cache_pages_from_env(),
            encryption: None,
        }
    }
}

impl DbOptions {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn use_wal(mut self, use_wal: bool) -> Self {
        self.use_wal = use_wal;
        self
    }

    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    pub fn auto_checkpoint(mut self, auto: bool) -> Self {
        self.auto_checkpoint = auto;
        self
    }

    pub fn wal_autocheckpoint_threshold_bytes(mut self, bytes: u64) -> Self {
        self.wal_autocheckpoint_threshold_bytes = bytes;
        self
    }

    pub fn expansion_page_count(mut self, pages: u32) -> Self {
        self.expansion_page_count = pages;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.encryption = Some(EncryptionOptions::new(password));
        self
    }

    pub fn encryption(mut self, encryption: EncryptionOptions) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(crate::error::GaldrError::InvalidArgument(format!(
                "page size {} below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        // Slot directories store u16 offsets; one page must stay below
        // that range.
        if self.page_size > 32768 {
            return Err(crate::error::GaldrError::InvalidArgument(format!(
                "page size {} above maximum 32768",
                self.page_size
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(crate::error::GaldrError::InvalidArgument(format!(
                "page size {} must be a power of two",
                self.page_size
            )));
        }
        if self.expansion_page_count == 0 {
            return Err(crate::error::GaldrError::InvalidArgument(
                "expansion page count must be positive".into(),
            ));
        }
        if let Some(enc) = &self.encryption {
            if enc.kdf_iterations == 0 {
                return Err(crate::error::GaldrError::InvalidArgument(
                    "kdf iterations must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

fn cache_pages_from_env() -> usize {
    std::env::var(CACHE_PAGES_ENV)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_CACHE_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DbOptions::default().validate().is_ok());
    }

    #[test]
    fn test_small_page_size_rejected() {
        let opts = DbOptions::default().page_size(1024);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_non_power_of_two_rejected() {
        let opts = DbOptions::default().page_size(5000);
        assert!(opts.validate().is_err());
    }
}
