use std::{borrow::Cow, fmt::Display};

/// The error type of the crate.
#[derive(Debug)]
pub enum Error {
    /// Invalid 7z signature found in the file header.
    BadSignature([u8; 6]),
    /// Unsupported 7z format version.
    UnsupportedVersion {
        /// Major version number.
        major: u8,
        /// Minor version number.
        minor: u8,
    },
    /// The 20 byte start header does not match its stored CRC-32.
    StartHeaderCrcMismatch,
    /// The next header does not match the CRC-32 stored in the start header.
    NextHeaderCrcMismatch,
    /// The next header position or size points outside of the file.
    NextHeaderOutOfBounds,
    /// The start header CRC is zero and the header bytes are all zero.
    ///
    /// Typically produced by truncated multi-volume downloads. Opening the
    /// archive again with [`ReaderOptions::with_recover_broken_archives`]
    /// enabled may still succeed.
    ///
    /// [`ReaderOptions::with_recover_broken_archives`]: crate::ReaderOptions::with_recover_broken_archives
    RecoverableStartHeader,
    /// A block stream did not match its declared CRC-32.
    BlockCrcMismatch,
    /// An entry's content did not match its declared CRC-32.
    EntryCrcMismatch,
    /// A raw pack stream did not match its declared CRC-32.
    PackCrcMismatch,
    /// IO error with optional context message.
    Io(std::io::Error, Cow<'static, str>),
    /// Other error with description.
    Other(Cow<'static, str>),
    /// Bad terminated streams info.
    BadTerminatedStreamsInfo(u8),
    /// Bad terminated unpack info.
    BadTerminatedUnpackInfo,
    /// Bad terminated pack info.
    BadTerminatedPackInfo(u8),
    /// Bad terminated sub streams info.
    BadTerminatedSubStreamsInfo,
    /// Bad terminated header.
    BadTerminatedHeader(u8),
    /// A metadata block uses external storage, which the format reserves but
    /// no known writer produces.
    ExternalUnsupported,
    /// Unsupported compression method.
    UnsupportedCompressionMethod(String),
    /// The memory required to parse the archive exceeds the configured limit.
    MaxMemLimited {
        /// Maximum allowed memory in KiB.
        max_kib: usize,
        /// Memory required to load the archive in KiB.
        required_kib: usize,
    },
    /// Password required for an encrypted archive.
    PasswordRequired,
    /// Feature or operation not supported.
    Unsupported(Cow<'static, str>),
    /// No entry with the given name exists in the archive.
    FileNotFound,
    /// [`Lz77Compressor::prefill`] was called after compression had started.
    ///
    /// [`Lz77Compressor::prefill`]: crate::lz77::Lz77Compressor::prefill
    PrefillAfterStart,
    /// Invalid combination of LZ77 matcher parameters.
    InvalidLz77Parameters(Cow<'static, str>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::io(value)
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e, msg) if msg.is_empty() => e,
            other => std::io::Error::other(other),
        }
    }
}

impl Error {
    #[inline]
    pub(crate) fn other<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::Other(s.into())
    }

    #[inline]
    pub(crate) fn unsupported<S: Into<Cow<'static, str>>>(s: S) -> Self {
        Self::Unsupported(s.into())
    }

    pub(crate) fn io(e: std::io::Error) -> Self {
        // Errors raised by our own stream shims travel through the io layer,
        // unwrap them back into their original kind.
        match e.downcast::<Error>() {
            Ok(inner) => inner,
            Err(e) => Self::Io(e, "".into()),
        }
    }

    #[inline]
    pub(crate) fn file_open(e: std::io::Error, filename: impl Into<Cow<'static, str>>) -> Self {
        Self::Io(e, filename.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self, f)
    }
}

impl std::error::Error for Error {}
