use crate::{NtTime, bitset::BitSet, block::*};

pub(crate) const SIGNATURE_HEADER_SIZE: u64 = 32;
pub(crate) const SEVEN_Z_SIGNATURE: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

pub(crate) const K_END: u8 = 0x00;
pub(crate) const K_HEADER: u8 = 0x01;
pub(crate) const K_ARCHIVE_PROPERTIES: u8 = 0x02;
pub(crate) const K_ADDITIONAL_STREAMS_INFO: u8 = 0x03;
pub(crate) const K_MAIN_STREAMS_INFO: u8 = 0x04;
pub(crate) const K_FILES_INFO: u8 = 0x05;
pub(crate) const K_PACK_INFO: u8 = 0x06;
pub(crate) const K_UNPACK_INFO: u8 = 0x07;
pub(crate) const K_SUB_STREAMS_INFO: u8 = 0x08;
pub(crate) const K_SIZE: u8 = 0x09;
pub(crate) const K_CRC: u8 = 0x0A;
pub(crate) const K_FOLDER: u8 = 0x0B;
pub(crate) const K_CODERS_UNPACK_SIZE: u8 = 0x0C;
pub(crate) const K_NUM_UNPACK_STREAM: u8 = 0x0D;
pub(crate) const K_EMPTY_STREAM: u8 = 0x0E;
pub(crate) const K_EMPTY_FILE: u8 = 0x0F;
pub(crate) const K_ANTI: u8 = 0x10;
pub(crate) const K_NAME: u8 = 0x11;
pub(crate) const K_C_TIME: u8 = 0x12;
pub(crate) const K_A_TIME: u8 = 0x13;
pub(crate) const K_M_TIME: u8 = 0x14;
pub(crate) const K_WIN_ATTRIBUTES: u8 = 0x15;
pub(crate) const K_ENCODED_HEADER: u8 = 0x17;
pub(crate) const K_START_POS: u8 = 0x18;
pub(crate) const K_DUMMY: u8 = 0x19;

/// A parsed 7z archive structure.
///
/// Holds the metadata needed for decompression: the entry list, the
/// compression blocks and the mapping between entries, blocks and raw pack
/// streams. The structure is immutable once parsed; re-reading the same
/// archive yields an identical structure.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    /// Offset of the first pack stream, relative to the end of the signature
    /// header.
    pub(crate) pack_pos: u64,
    pub(crate) pack_sizes: Vec<u64>,
    pub(crate) pack_crcs_defined: BitSet,
    pub(crate) pack_crcs: Vec<u32>,
    pub(crate) sub_streams_info: Option<SubStreamsInfo>,
    /// Compression blocks ("folders") in the archive.
    pub blocks: Vec<Block>,
    /// File, directory and anti-item entries in the archive.
    pub files: Vec<ArchiveEntry>,
    /// Mapping between files, blocks, and pack streams.
    pub stream_map: StreamMap,
    /// Whether any block holds more than one entry (solid compression).
    pub is_solid: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SubStreamsInfo {
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) has_crc: BitSet,
    pub(crate) crcs: Vec<u32>,
}

/// A single entry (file, directory or anti-item) of a 7z archive.
#[derive(Debug, Default, Clone)]
pub struct ArchiveEntry {
    /// Name/path of the entry within the archive.
    pub name: String,
    /// Whether this entry has an associated data stream.
    pub has_stream: bool,
    /// Whether this entry is a directory.
    pub is_directory: bool,
    /// Whether this is an anti-item (used for deletion in incremental
    /// updates).
    pub is_anti_item: bool,
    /// Whether a creation time is present.
    pub has_creation_date: bool,
    /// Creation time.
    pub creation_date: NtTime,
    /// Whether a modification time is present.
    pub has_last_modified_date: bool,
    /// Modification time.
    pub last_modified_date: NtTime,
    /// Whether an access time is present.
    pub has_access_date: bool,
    /// Access time.
    pub access_date: NtTime,
    /// Whether Windows file attributes are present.
    pub has_windows_attributes: bool,
    /// Windows file attributes.
    pub windows_attributes: u32,
    /// Whether a content CRC is present.
    pub has_crc: bool,
    /// CRC-32 of the uncompressed content.
    pub crc: u32,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Size of the pack stream of this entry's block. Only set for the first
    /// entry of each block.
    pub compressed_size: u64,
    /// The methods of the coder pipeline this entry was compressed with.
    /// Populated when the entry's block is first decoded.
    pub content_methods: Option<Vec<CoderMethod>>,
}

impl ArchiveEntry {
    /// Returns the name/path of this entry within the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Returns whether this entry is an anti-item.
    pub fn is_anti_item(&self) -> bool {
        self.is_anti_item
    }

    /// Returns whether this entry has an associated data stream.
    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    /// Returns the uncompressed size of this entry in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the creation time, if one is stored.
    pub fn creation_date(&self) -> Option<NtTime> {
        self.has_creation_date.then_some(self.creation_date)
    }

    /// Returns the modification time, if one is stored.
    pub fn last_modified_date(&self) -> Option<NtTime> {
        self.has_last_modified_date.then_some(self.last_modified_date)
    }

    /// Returns the access time, if one is stored.
    pub fn access_date(&self) -> Option<NtTime> {
        self.has_access_date.then_some(self.access_date)
    }

    /// Returns the Windows file attributes, if stored.
    pub fn windows_attributes(&self) -> Option<u32> {
        self.has_windows_attributes.then_some(self.windows_attributes)
    }
}

/// A compression, filter or encryption method of the coder pipeline.
///
/// The table intentionally also carries methods this crate does not decode,
/// so that errors can name the method instead of dumping raw id bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct CoderMethod(&'static str, &'static [u8]);

impl CoderMethod {
    /// Method ID for COPY (no compression).
    pub const ID_COPY: &'static [u8] = &[0x00];
    /// Method ID for the Delta filter.
    pub const ID_DELTA: &'static [u8] = &[0x03];
    /// Method ID for LZMA compression.
    pub const ID_LZMA: &'static [u8] = &[0x03, 0x01, 0x01];
    /// Method ID for the BCJ x86 filter.
    pub const ID_BCJ_X86: &'static [u8] = &[0x03, 0x03, 0x01, 0x03];
    /// Method ID for the BCJ2 filter.
    pub const ID_BCJ2: &'static [u8] = &[0x03, 0x03, 0x01, 0x1B];
    /// Method ID for PPMD compression.
    pub const ID_PPMD: &'static [u8] = &[0x03, 0x04, 0x01];
    /// Method ID for LZMA2 compression.
    pub const ID_LZMA2: &'static [u8] = &[0x21];
    /// Method ID for BZIP2 compression.
    pub const ID_BZIP2: &'static [u8] = &[0x04, 0x02, 0x02];
    /// Method ID for Deflate compression.
    pub const ID_DEFLATE: &'static [u8] = &[0x04, 0x01, 0x08];
    /// Method ID for Deflate64 compression.
    pub const ID_DEFLATE64: &'static [u8] = &[0x04, 0x01, 0x09];
    /// Method ID for Zstandard compression.
    pub const ID_ZSTD: &'static [u8] = &[0x04, 0xF7, 0x11, 0x01];
    /// Method ID for Brotli compression.
    pub const ID_BROTLI: &'static [u8] = &[0x04, 0xF7, 0x11, 0x02];
    /// Method ID for LZ4 compression.
    pub const ID_LZ4: &'static [u8] = &[0x04, 0xF7, 0x11, 0x04];
    /// Method ID for AES256-SHA256 encryption.
    pub const ID_AES256_SHA256: &'static [u8] = &[0x06, 0xF1, 0x07, 0x01];

    /// COPY method (no compression).
    pub const COPY: Self = Self("COPY", Self::ID_COPY);
    /// Delta filter method.
    pub const DELTA: Self = Self("DELTA", Self::ID_DELTA);
    /// LZMA compression method.
    pub const LZMA: Self = Self("LZMA", Self::ID_LZMA);
    /// LZMA2 compression method.
    pub const LZMA2: Self = Self("LZMA2", Self::ID_LZMA2);
    /// PPMD compression method.
    pub const PPMD: Self = Self("PPMD", Self::ID_PPMD);
    /// BZIP2 compression method.
    pub const BZIP2: Self = Self("BZIP2", Self::ID_BZIP2);
    /// Deflate compression method.
    pub const DEFLATE: Self = Self("DEFLATE", Self::ID_DEFLATE);
    /// Deflate64 compression method.
    pub const DEFLATE64: Self = Self("DEFLATE64", Self::ID_DEFLATE64);
    /// Zstandard compression method.
    pub const ZSTD: Self = Self("ZSTD", Self::ID_ZSTD);
    /// Brotli compression method.
    pub const BROTLI: Self = Self("BROTLI", Self::ID_BROTLI);
    /// LZ4 compression method.
    pub const LZ4: Self = Self("LZ4", Self::ID_LZ4);
    /// BCJ x86 filter method.
    pub const BCJ_X86: Self = Self("BCJ_X86", Self::ID_BCJ_X86);
    /// BCJ2 filter method.
    pub const BCJ2: Self = Self("BCJ2", Self::ID_BCJ2);
    /// AES256-SHA256 encryption method.
    pub const AES256_SHA256: Self = Self("AES256SHA256", Self::ID_AES256_SHA256);

    const METHODS: &'static [&'static CoderMethod] = &[
        &Self::COPY,
        &Self::DELTA,
        &Self::LZMA,
        &Self::LZMA2,
        &Self::PPMD,
        &Self::BZIP2,
        &Self::DEFLATE,
        &Self::DEFLATE64,
        &Self::ZSTD,
        &Self::BROTLI,
        &Self::LZ4,
        &Self::BCJ_X86,
        &Self::BCJ2,
        &Self::AES256_SHA256,
    ];

    /// Returns the human-readable name of this method.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.0
    }

    /// Returns the binary ID of this method.
    #[inline]
    pub const fn id(&self) -> &'static [u8] {
        self.1
    }

    /// Finds a method by its binary ID.
    #[inline]
    pub fn by_id(id: &[u8]) -> Option<Self> {
        Self::METHODS.iter().find(|m| m.id() == id).copied().copied()
    }
}

/// The derived mapping between entries, blocks and pack streams.
///
/// All fields are running sums over the parsed metadata; the map is computed
/// after parsing and never stored in the archive itself.
#[derive(Debug, Default, Clone)]
pub struct StreamMap {
    pub(crate) block_first_pack_stream_index: Vec<usize>,
    pub(crate) pack_stream_offsets: Vec<u64>,
    /// Index of the first file of each block.
    pub block_first_file_index: Vec<usize>,
    /// Block index for each file (`None` for entries without a stream).
    pub file_block_index: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StartHeader {
    pub(crate) next_header_offset: u64,
    pub(crate) next_header_size: u64,
    pub(crate) next_header_crc: u32,
}
