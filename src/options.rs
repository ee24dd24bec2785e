use crate::Password;

/// The default backwards search budget of the broken archive recovery scan.
pub const DEFAULT_RECOVERY_SEARCH_LIMIT: u64 = 1024 * 1024;

/// Options controlling how an archive is opened and parsed.
///
/// ```rust
/// use sevenz_stream::ReaderOptions;
///
/// let options = ReaderOptions::default()
///     .with_max_memory_limit_kib(64 * 1024)
///     .with_recover_broken_archives(true);
/// ```
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub(crate) password: Password,
    pub(crate) max_memory_limit_kib: usize,
    pub(crate) default_name: Option<String>,
    pub(crate) use_default_name_for_unnamed_entries: bool,
    pub(crate) try_to_recover_broken_archives: bool,
    pub(crate) recovery_search_limit: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            password: Password::empty(),
            max_memory_limit_kib: usize::MAX / 1024,
            default_name: None,
            use_default_name_for_unnamed_entries: false,
            try_to_recover_broken_archives: false,
            recovery_search_limit: DEFAULT_RECOVERY_SEARCH_LIMIT,
        }
    }
}

impl ReaderOptions {
    /// Sets the password used for encrypted archives.
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = password;
        self
    }

    /// Rejects archives whose metadata would require more than `limit_kib`
    /// KiB of memory to load.
    ///
    /// The requirement is estimated from the declared header counts before
    /// any archive structure is allocated, so a hostile archive cannot force
    /// a large allocation simply by declaring millions of entries.
    pub fn with_max_memory_limit_kib(mut self, limit_kib: usize) -> Self {
        self.max_memory_limit_kib = limit_kib;
        self
    }

    /// Sets the name used for entries without one when
    /// [`with_use_default_name_for_unnamed_entries`] is enabled.
    ///
    /// [`with_use_default_name_for_unnamed_entries`]: Self::with_use_default_name_for_unnamed_entries
    pub fn with_default_name(mut self, name: impl Into<String>) -> Self {
        self.default_name = Some(name.into());
        self
    }

    /// Gives entries without a stored name the configured default name
    /// instead of an empty one.
    pub fn with_use_default_name_for_unnamed_entries(mut self, enabled: bool) -> Self {
        self.use_default_name_for_unnamed_entries = enabled;
        self
    }

    /// Scans for a usable end header when the start header is zeroed out.
    ///
    /// The scan parses candidate headers found anywhere in the last
    /// [`recovery_search_limit`](Self::with_recovery_search_limit) bytes of
    /// the file, so it should be combined with a tight memory limit when the
    /// input is untrusted.
    pub fn with_recover_broken_archives(mut self, enabled: bool) -> Self {
        self.try_to_recover_broken_archives = enabled;
        self
    }

    /// Sets how many bytes from the end of the file the recovery scan may
    /// search for an end header.
    pub fn with_recovery_search_limit(mut self, limit: u64) -> Self {
        self.recovery_search_limit = limit;
        self
    }
}
