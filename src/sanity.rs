//! First pass over the archive header.
//!
//! Walks the raw header buffer without allocating any archive structures,
//! validating the declared layout and tallying counts. The counts feed a
//! conservative memory estimate that is checked against the configured limit
//! before the second pass materialises blocks, entries and the stream map.

use std::io::Cursor;

use crate::{
    Error,
    archive::*,
    bitset::BitSet,
    block::{BindPair, Block, Coder},
    reader::{read_all_or_bits, read_bits, read_u8, read_u64, read_usize},
};

/// Counts collected by the first pass.
#[derive(Debug, Default)]
pub(crate) struct ParseStats {
    pub(crate) pack_streams: usize,
    pub(crate) blocks: usize,
    pub(crate) coders: usize,
    pub(crate) in_streams: usize,
    pub(crate) out_streams: usize,
    pub(crate) entries: usize,
    pub(crate) entries_with_stream: usize,
    pub(crate) sub_streams: usize,
    block_has_crc: Option<BitSet>,
    sub_streams_per_block: Vec<usize>,
}

impl ParseStats {
    /// Upper bound of the heap the second pass will allocate, in bytes.
    ///
    /// Doubled to stay conservative about allocator and container overhead.
    /// Strictly monotone in every count.
    fn estimated_bytes(&self) -> u64 {
        let pack_streams = self.pack_streams as u64;
        let blocks = self.blocks as u64;
        let entries = self.entries as u64;
        let stream_map = 2 * 8 * blocks + 8 * pack_streams + 8 * entries;
        let lower_bound = 16 * pack_streams
            + pack_streams / 8
            + blocks * size_of::<Block>() as u64
            + self.coders as u64 * size_of::<Coder>() as u64
            + (self.out_streams - self.blocks) as u64 * size_of::<BindPair>() as u64
            + 8 * (self.in_streams - self.out_streams + self.blocks) as u64
            + 8 * self.out_streams as u64
            + entries * size_of::<ArchiveEntry>() as u64
            + 13 * self.sub_streams as u64
            + stream_map;
        2 * lower_bound
    }

    pub(crate) fn required_kib(&self) -> usize {
        self.estimated_bytes().div_ceil(1024) as usize
    }

    pub(crate) fn assert_validity(&self, max_memory_limit_kib: usize) -> Result<(), Error> {
        if self.entries_with_stream > 0 && self.blocks == 0 {
            return Err(Error::other("archive with entries but no blocks"));
        }
        if self.entries_with_stream > self.sub_streams {
            return Err(Error::other(
                "archive doesn't contain enough sub streams for entries",
            ));
        }
        let required_kib = self.required_kib();
        log::debug!(
            "header declares {} entries, {} blocks, {} coders; estimated {required_kib} KiB",
            self.entries,
            self.blocks,
            self.coders
        );
        if required_kib > max_memory_limit_kib {
            return Err(Error::MaxMemLimited {
                max_kib: max_memory_limit_kib,
                required_kib,
            });
        }
        Ok(())
    }
}

/// Fails unless the buffer can still hold a bit vector (or its all-defined
/// expansion) for `bit_count` elements. Keeps a hostile count from forcing a
/// large allocation that the remaining header bytes could never justify.
fn assert_bits_available(
    header: &Cursor<&[u8]>,
    bit_count: usize,
    context: &str,
) -> Result<(), Error> {
    let remaining = header.get_ref().len() - header.position() as usize;
    if bit_count.div_ceil(8) > remaining {
        return Err(Error::other(format!(
            "{context} declares {bit_count} elements but only {remaining} header bytes remain"
        )));
    }
    Ok(())
}

/// Advances the cursor by `count` bytes, failing instead of running past the
/// end of the buffer.
fn skip(header: &mut Cursor<&[u8]>, count: u64, context: &str) -> Result<(), Error> {
    let remaining = header.get_ref().len() as u64 - header.position();
    if count > remaining {
        return Err(Error::other(format!(
            "unexpected end of header while reading {context}"
        )));
    }
    header.set_position(header.position() + count);
    Ok(())
}

/// Walks a full `kHeader` block, returning the collected counts.
///
/// The buffer cursor is left at an unspecified position; the caller rewinds
/// before the second pass.
pub(crate) fn check_header(
    header: &mut Cursor<&[u8]>,
    channel_size: u64,
    max_memory_limit_kib: usize,
) -> Result<ParseStats, Error> {
    let mut stats = ParseStats::default();

    let mut nid = read_u8(header)?;
    if nid == K_ARCHIVE_PROPERTIES {
        check_archive_properties(header)?;
        nid = read_u8(header)?;
    }
    if nid == K_ADDITIONAL_STREAMS_INFO {
        return Err(Error::other("Additional streams unsupported"));
    }
    if nid == K_MAIN_STREAMS_INFO {
        check_streams_info(header, channel_size, &mut stats)?;
        nid = read_u8(header)?;
    }
    if nid == K_FILES_INFO {
        check_files_info(header, &mut stats)?;
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::BadTerminatedHeader(nid));
    }

    stats.assert_validity(max_memory_limit_kib)?;
    Ok(stats)
}

/// The semantics of `kArchiveProperties` are undocumented; like the
/// reference implementation we validate the framing and discard the content.
fn check_archive_properties(header: &mut Cursor<&[u8]>) -> Result<(), Error> {
    let mut nid = read_u8(header)?;
    while nid != K_END {
        let property_size = read_u64(header)?;
        skip(header, property_size, "archive property")?;
        nid = read_u8(header)?;
    }
    Ok(())
}

pub(crate) fn check_streams_info(
    header: &mut Cursor<&[u8]>,
    channel_size: u64,
    stats: &mut ParseStats,
) -> Result<(), Error> {
    let mut nid = read_u8(header)?;
    if nid == K_PACK_INFO {
        check_pack_info(header, channel_size, stats)?;
        nid = read_u8(header)?;
    }
    if nid == K_UNPACK_INFO {
        check_unpack_info(header, stats)?;
        nid = read_u8(header)?;
    }
    if nid == K_SUB_STREAMS_INFO {
        check_sub_streams_info(header, stats)?;
        nid = read_u8(header)?;
    } else {
        stats.sub_streams = stats.blocks;
    }
    if nid != K_END {
        return Err(Error::BadTerminatedStreamsInfo(nid));
    }
    Ok(())
}

fn check_pack_info(
    header: &mut Cursor<&[u8]>,
    channel_size: u64,
    stats: &mut ParseStats,
) -> Result<(), Error> {
    let pack_pos = read_u64(header)?;
    if pack_pos > i64::MAX as u64 || SIGNATURE_HEADER_SIZE + pack_pos > channel_size {
        return Err(Error::other(format!("packPos ({pack_pos}) is out of range")));
    }
    let num_pack_streams = read_usize(header, "numPackStreams")?;
    stats.pack_streams = num_pack_streams;

    let mut nid = read_u8(header)?;
    if nid == K_SIZE {
        let mut total_pack_size: u64 = 0;
        for _ in 0..num_pack_streams {
            let pack_size = read_u64(header)?;
            total_pack_size = total_pack_size
                .checked_add(pack_size)
                .ok_or_else(|| Error::other("pack sizes overflow"))?;
            let end_of_pack_streams = SIGNATURE_HEADER_SIZE
                .checked_add(pack_pos)
                .and_then(|v| v.checked_add(total_pack_size));
            match end_of_pack_streams {
                Some(end) if end <= channel_size => {}
                _ => {
                    return Err(Error::other(format!(
                        "packSize ({pack_size}) is out of range"
                    )));
                }
            }
        }
        nid = read_u8(header)?;
    }
    if nid == K_CRC {
        let crcs_defined = read_all_or_bits(header, num_pack_streams)?.len();
        skip(header, 4 * crcs_defined as u64, "pack CRCs")?;
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::BadTerminatedPackInfo(nid));
    }
    Ok(())
}

fn check_unpack_info(header: &mut Cursor<&[u8]>, stats: &mut ParseStats) -> Result<(), Error> {
    let nid = read_u8(header)?;
    if nid != K_FOLDER {
        return Err(Error::other(format!("Expected kFolder, got {nid}")));
    }
    let num_blocks = read_usize(header, "numBlocks")?;
    stats.blocks = num_blocks;
    let external = read_u8(header)?;
    if external != 0 {
        return Err(Error::ExternalUnsupported);
    }

    let mut packed_total = 0usize;
    for _ in 0..num_blocks {
        packed_total += check_block(header, stats)?;
    }
    if packed_total > stats.pack_streams {
        return Err(Error::other(
            "blocks declare more packed streams than the archive contains",
        ));
    }

    let nid = read_u8(header)?;
    if nid != K_CODERS_UNPACK_SIZE {
        return Err(Error::other(format!("Expected kCodersUnpackSize, got {nid}")));
    }
    for _ in 0..stats.out_streams {
        let unpack_size = read_u64(header)?;
        if unpack_size > i64::MAX as u64 {
            return Err(Error::other(format!("negative unpackSize {unpack_size}")));
        }
    }

    let mut nid = read_u8(header)?;
    if nid == K_CRC {
        let crcs_defined = read_all_or_bits(header, num_blocks)?;
        skip(header, 4 * crcs_defined.len() as u64, "block CRCs")?;
        stats.block_has_crc = Some(crcs_defined);
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::BadTerminatedUnpackInfo);
    }
    Ok(())
}

/// Validates a single block declaration and returns the number of packed
/// streams it consumes.
fn check_block(header: &mut Cursor<&[u8]>, stats: &mut ParseStats) -> Result<usize, Error> {
    let num_coders = read_usize(header, "numCoders")?;
    if num_coders == 0 {
        return Err(Error::other("block with no coders"));
    }

    let mut total_in_streams = 0usize;
    let mut total_out_streams = 0usize;
    for _ in 0..num_coders {
        let flags = read_u8(header)?;
        let id_len = (flags & 0xF) as u64;
        let is_simple = (flags & 0x10) == 0;
        let has_attributes = (flags & 0x20) != 0;
        let more_alternative_methods = (flags & 0x80) != 0;
        if more_alternative_methods {
            return Err(Error::other(
                "Alternative methods are unsupported, please report. The reference implementation doesn't support them either.",
            ));
        }
        if id_len > 4 {
            return Err(Error::unsupported("method id longer than 4 bytes"));
        }
        skip(header, id_len, "method id")?;
        let (num_in, num_out) = if is_simple {
            (1, 1)
        } else {
            (read_u64(header)?, read_u64(header)?)
        };
        if num_in != 1 || num_out != 1 {
            return Err(Error::unsupported(
                "Multi input/output stream coders are not yet supported",
            ));
        }
        if has_attributes {
            let properties_size = read_u64(header)?;
            skip(header, properties_size, "coder properties")?;
        }
        stats.coders += 1;
        total_in_streams += 1;
        total_out_streams += 1;
    }
    stats.in_streams += total_in_streams;
    stats.out_streams += total_out_streams;

    let num_bind_pairs = total_out_streams - 1;
    if total_in_streams < num_bind_pairs {
        return Err(Error::other(
            "Total input streams can't be less than the number of bind pairs",
        ));
    }
    for _ in 0..num_bind_pairs {
        let in_index = read_u64(header)?;
        if in_index >= total_in_streams as u64 {
            return Err(Error::other("bind pair in index out of range"));
        }
        let out_index = read_u64(header)?;
        if out_index >= total_out_streams as u64 {
            return Err(Error::other("bind pair out index out of range"));
        }
    }

    let num_packed_streams = total_in_streams - num_bind_pairs;
    if num_packed_streams == 0 {
        return Err(Error::other("block without a packed stream"));
    }
    if num_packed_streams > 1 {
        for _ in 0..num_packed_streams {
            let index = read_u64(header)?;
            if index >= total_in_streams as u64 {
                return Err(Error::other("packed stream index out of range"));
            }
        }
    }
    Ok(num_packed_streams)
}

fn check_sub_streams_info(header: &mut Cursor<&[u8]>, stats: &mut ParseStats) -> Result<(), Error> {
    let mut nid = read_u8(header)?;
    if nid == K_NUM_UNPACK_STREAM {
        stats.sub_streams = 0;
        for _ in 0..stats.blocks {
            let num_streams = read_usize(header, "numStreams")?;
            stats.sub_streams = stats
                .sub_streams
                .checked_add(num_streams)
                .ok_or_else(|| Error::other("totalUnpackStreams overflow"))?;
            stats.sub_streams_per_block.push(num_streams);
        }
        nid = read_u8(header)?;
    } else {
        stats.sub_streams = stats.blocks;
    }

    if nid == K_SIZE {
        for block_index in 0..stats.blocks {
            let num_streams = stats
                .sub_streams_per_block
                .get(block_index)
                .copied()
                .unwrap_or(1);
            if num_streams == 0 {
                continue;
            }
            for _ in 0..num_streams - 1 {
                let size = read_u64(header)?;
                if size > i64::MAX as u64 {
                    return Err(Error::other(format!("negative unpackSize {size}")));
                }
            }
        }
        nid = read_u8(header)?;
    }

    // Digests are only stored for sub streams whose CRC is not already known
    // from the block level.
    let mut num_digests = 0usize;
    for block_index in 0..stats.blocks {
        let num_streams = stats
            .sub_streams_per_block
            .get(block_index)
            .copied()
            .unwrap_or(1);
        let block_crc_known = stats
            .block_has_crc
            .as_ref()
            .is_some_and(|crcs| crcs.contains(block_index));
        if num_streams != 1 || !block_crc_known {
            num_digests += num_streams;
        }
    }

    if nid == K_CRC {
        assert_bits_available(header, num_digests, "sub stream CRCs")?;
        let crcs_defined = read_all_or_bits(header, num_digests)?.len();
        skip(header, 4 * crcs_defined as u64, "sub stream CRCs")?;
        nid = read_u8(header)?;
    }
    if nid != K_END {
        return Err(Error::BadTerminatedSubStreamsInfo);
    }
    Ok(())
}

fn check_files_info(header: &mut Cursor<&[u8]>, stats: &mut ParseStats) -> Result<(), Error> {
    let num_entries = read_usize(header, "numFiles")?;
    stats.entries = num_entries;

    let mut empty_streams: Option<usize> = None;
    loop {
        let property_type = read_u8(header)?;
        if property_type == K_END {
            break;
        }
        let size = read_u64(header)?;
        let start = header.position();
        match property_type {
            K_EMPTY_STREAM => {
                assert_bits_available(header, num_entries, "kEmptyStream")?;
                empty_streams = Some(read_bits(header, num_entries)?.len());
            }
            K_EMPTY_FILE | K_ANTI => {
                let Some(count) = empty_streams else {
                    return Err(Error::other(
                        "Header format error: kEmptyStream must appear before kEmptyFile and kAnti",
                    ));
                };
                read_bits(header, count)?;
            }
            K_NAME => {
                let external = read_u8(header)?;
                if external != 0 {
                    return Err(Error::ExternalUnsupported);
                }
                if size == 0 || (size - 1) & 1 != 0 {
                    return Err(Error::other("file names length invalid"));
                }
                let names_len = (size - 1) as usize;
                let pos = header.position() as usize;
                let buf = header.get_ref();
                if pos + names_len > buf.len() {
                    return Err(Error::other("file names run past the end of the header"));
                }
                let names_seen = buf[pos..pos + names_len]
                    .chunks_exact(2)
                    .filter(|pair| pair[0] == 0 && pair[1] == 0)
                    .count();
                if names_seen != num_entries {
                    return Err(Error::other(format!(
                        "invalid number of file names ({names_seen} instead of {num_entries})"
                    )));
                }
                skip(header, names_len as u64, "file names")?;
            }
            K_C_TIME | K_A_TIME | K_M_TIME => {
                assert_bits_available(header, num_entries, "timestamps")?;
                let times_defined = read_all_or_bits(header, num_entries)?.len();
                let external = read_u8(header)?;
                if external != 0 {
                    return Err(Error::ExternalUnsupported);
                }
                skip(header, 8 * times_defined as u64, "timestamps")?;
            }
            K_WIN_ATTRIBUTES => {
                assert_bits_available(header, num_entries, "attributes")?;
                let attributes_defined = read_all_or_bits(header, num_entries)?.len();
                let external = read_u8(header)?;
                if external != 0 {
                    return Err(Error::ExternalUnsupported);
                }
                skip(header, 4 * attributes_defined as u64, "attributes")?;
            }
            K_START_POS => {
                return Err(Error::other("kStartPos is unsupported, please report"));
            }
            K_DUMMY => {
                skip(header, size, "padding")?;
            }
            _ => {
                skip(header, size, "unknown property")?;
            }
        }
        if header.position() - start != size {
            return Err(Error::other(format!(
                "property {property_type:#04x} declares size {size} but spans {}",
                header.position() - start
            )));
        }
    }

    stats.entries_with_stream = num_entries - empty_streams.unwrap_or(0);
    Ok(())
}
