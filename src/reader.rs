use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom},
    rc::Rc,
};

use crc32fast::Hasher;

use crate::{
    ReaderOptions, archive::*, bitset::BitSet, block::*, decoder::add_decoder, error::Error,
    sanity,
};

/// Caps a reader at a fixed number of bytes.
///
/// Issued sub streams never own the underlying channel; dropping one leaves
/// the channel untouched.
pub struct BoundedReader<R: Read> {
    inner: R,
    remaining: u64,
}

impl<R: Read> BoundedReader<R> {
    /// Creates a reader returning at most `limit` bytes from `inner`.
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let limit = (buf.len() as u64).min(self.remaining) as usize;
        let size = self.inner.read(&mut buf[..limit])?;
        self.remaining -= size as u64;
        Ok(size)
    }
}

/// A reader restricted to a byte range of a seekable source.
///
/// Re-seeks before every read, so several instances may share one source as
/// long as reads are not interleaved within a single call.
#[derive(Debug)]
pub struct SeekableBoundedReader<R: Read + Seek> {
    inner: R,
    cur: u64,
    bounds: (u64, u64),
}

impl<R: Read + Seek> SeekableBoundedReader<R> {
    /// Creates a reader over the half-open range `bounds` of `inner`.
    pub fn new(inner: R, bounds: (u64, u64)) -> Self {
        Self {
            inner,
            cur: bounds.0,
            bounds,
        }
    }
}

impl<R: Read + Seek> Seek for SeekableBoundedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(pos) => self.bounds.0 as i64 + pos as i64,
            SeekFrom::End(pos) => self.bounds.1 as i64 + pos,
            SeekFrom::Current(pos) => self.cur as i64 + pos,
        };
        if new_pos < 0 {
            return Err(std::io::Error::other("seek before start"));
        }
        self.cur = new_pos as u64;
        self.inner.seek(SeekFrom::Start(self.cur))
    }
}

impl<R: Read + Seek> Read for SeekableBoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cur >= self.bounds.1 {
            return Ok(0);
        }
        if self.inner.stream_position()? != self.cur {
            self.inner.seek(SeekFrom::Start(self.cur))?;
        }
        let limit = (buf.len() as u64).min(self.bounds.1 - self.cur) as usize;
        let size = self.inner.read(&mut buf[..limit])?;
        self.cur += size as u64;
        Ok(size)
    }
}

/// Enforces that exactly `size` bytes pass through and that they match the
/// expected CRC-32.
///
/// Verification is deferred to the read call after the final byte has been
/// returned, so the caller receives all content bytes before a mismatch
/// surfaces. A short underlying stream is an error, never silent truncation.
pub(crate) struct Crc32VerifyingReader<R> {
    inner: R,
    digest: Hasher,
    expected: u32,
    remaining: u64,
    pending: bool,
    mismatch: fn() -> Error,
}

impl<R: Read> Crc32VerifyingReader<R> {
    pub(crate) fn new(inner: R, size: u64, expected: u32, mismatch: fn() -> Error) -> Self {
        Self {
            inner,
            digest: Hasher::new(),
            expected,
            remaining: size,
            pending: false,
            mismatch,
        }
    }
}

impl<R: Read> Read for Crc32VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending {
            self.pending = false;
            let actual = std::mem::replace(&mut self.digest, Hasher::new()).finalize();
            if actual != self.expected {
                return Err(std::io::Error::other((self.mismatch)()));
            }
        }
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = (buf.len() as u64).min(self.remaining) as usize;
        let size = self.inner.read(&mut buf[..limit])?;
        if size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before its declared size",
            ));
        }
        self.digest.update(&buf[..size]);
        self.remaining -= size as u64;
        if self.remaining == 0 {
            self.pending = true;
        }
        Ok(size)
    }
}

/// Counts the bytes read through it, observable from outside the decoder
/// stack it is buried in.
pub(crate) struct CountingReader<R> {
    inner: R,
    read_bytes: u64,
    counter: Rc<Cell<u64>>,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            read_bytes: 0,
            counter: Rc::new(Cell::new(0)),
        }
    }

    pub(crate) fn counter(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.counter)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.inner.read(buf)?;
        self.read_bytes += size as u64;
        self.counter.set(self.read_bytes);
        Ok(size)
    }
}

impl Archive {
    /// Opens the 7z file at `path` and parses its metadata.
    #[inline]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Archive, Error> {
        Self::open_with_options(path, &ReaderOptions::default())
    }

    /// Opens the 7z file at `path` with explicit [`ReaderOptions`].
    #[inline]
    pub fn open_with_options(
        path: impl AsRef<std::path::Path>,
        options: &ReaderOptions,
    ) -> Result<Archive, Error> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| Error::file_open(e, path.as_ref().to_string_lossy().to_string()))?;
        Self::read_with_options(&mut file, options)
    }

    /// Parses the archive metadata from `reader`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::fs::File;
    ///
    /// use sevenz_stream::Archive;
    ///
    /// let mut reader = File::open("example.7z").unwrap();
    /// let archive = Archive::read(&mut reader).unwrap();
    ///
    /// for entry in &archive.files {
    ///     println!("{}", entry.name());
    /// }
    /// ```
    #[inline]
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Archive, Error> {
        Self::read_with_options(reader, &ReaderOptions::default())
    }

    /// Parses the archive metadata from `reader` with explicit
    /// [`ReaderOptions`].
    pub fn read_with_options<R: Read + Seek>(
        reader: &mut R,
        options: &ReaderOptions,
    ) -> Result<Archive, Error> {
        let channel_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut signature = [0; 6];
        reader.read_exact(&mut signature).map_err(Error::io)?;
        if signature != SEVEN_Z_SIGNATURE {
            return Err(Error::BadSignature(signature));
        }
        let mut versions = [0; 2];
        reader.read_exact(&mut versions).map_err(Error::io)?;
        if versions[0] != 0 {
            return Err(Error::UnsupportedVersion {
                major: versions[0],
                minor: versions[1],
            });
        }

        let start_header_crc = read_u32(reader)?;

        // A zeroed start header is what truncated multi-volume downloads look
        // like. It cannot be parsed, but the end header may still be intact
        // somewhere near the end of the file.
        if start_header_crc == 0 {
            let current_position = reader.stream_position().map_err(Error::io)?;
            let mut buf = [0; 20];
            reader.read_exact(&mut buf).map_err(Error::io)?;
            reader
                .seek(SeekFrom::Start(current_position))
                .map_err(Error::io)?;
            if buf.iter().all(|b| *b == 0) {
                if options.try_to_recover_broken_archives {
                    return Self::try_to_locate_end_header(reader, channel_size, options);
                }
                return Err(Error::RecoverableStartHeader);
            }
        }

        let start_header = Self::read_start_header(reader, start_header_crc)?;
        let end_of_header = SIGNATURE_HEADER_SIZE
            .checked_add(start_header.next_header_offset)
            .and_then(|v| v.checked_add(start_header.next_header_size));
        match end_of_header {
            Some(end) if end <= channel_size => {}
            _ => return Err(Error::NextHeaderOutOfBounds),
        }

        Self::init_archive(reader, channel_size, start_header, options, true)
    }

    fn read_start_header<R: Read>(
        reader: &mut R,
        start_header_crc: u32,
    ) -> Result<StartHeader, Error> {
        let mut buf = [0; 20];
        reader.read_exact(&mut buf).map_err(Error::io)?;
        if crc32fast::hash(&buf) != start_header_crc {
            return Err(Error::StartHeaderCrcMismatch);
        }
        let mut buf = buf.as_slice();
        Ok(StartHeader {
            next_header_offset: read_u64le(&mut buf)?,
            next_header_size: read_u64le(&mut buf)?,
            next_header_crc: read_u32(&mut buf)?,
        })
    }

    /// Scans backwards from the end of the file for a byte that could start
    /// an end header and accepts the first candidate that parses into an
    /// archive with entries and pack streams. Parse failures are expected
    /// while scanning and do not abort the search.
    fn try_to_locate_end_header<R: Read + Seek>(
        reader: &mut R,
        channel_size: u64,
        options: &ReaderOptions,
    ) -> Result<Self, Error> {
        let min_pos = SIGNATURE_HEADER_SIZE
            .max(channel_size.saturating_sub(options.recovery_search_limit));
        let mut pos = channel_size.saturating_sub(1);
        while pos > min_pos {
            pos -= 1;
            reader.seek(SeekFrom::Start(pos)).map_err(Error::io)?;
            let nid = read_u8(reader)?;
            if nid != K_HEADER && nid != K_ENCODED_HEADER {
                continue;
            }
            let start_header = StartHeader {
                next_header_offset: pos - SIGNATURE_HEADER_SIZE,
                next_header_size: channel_size - pos,
                next_header_crc: 0,
            };
            match Self::init_archive(reader, channel_size, start_header, options, false) {
                Ok(archive) if !archive.files.is_empty() && !archive.pack_sizes.is_empty() => {
                    log::debug!("recovered end header at offset {pos}");
                    return Ok(archive);
                }
                Ok(_) => {}
                Err(e) => log::debug!("end header candidate at offset {pos} rejected: {e}"),
            }
        }
        Err(Error::other(
            "Start header corrupt and unable to guess end header",
        ))
    }

    fn init_archive<R: Read + Seek>(
        reader: &mut R,
        channel_size: u64,
        start_header: StartHeader,
        options: &ReaderOptions,
        verify_crc: bool,
    ) -> Result<Self, Error> {
        let next_header_size = assert_usize(start_header.next_header_size, "nextHeaderSize")?;

        reader
            .seek(SeekFrom::Start(
                SIGNATURE_HEADER_SIZE + start_header.next_header_offset,
            ))
            .map_err(Error::io)?;
        let mut header_bytes = vec![0u8; next_header_size];
        reader.read_exact(&mut header_bytes).map_err(Error::io)?;
        if verify_crc && crc32fast::hash(&header_bytes) != start_header.next_header_crc {
            return Err(Error::NextHeaderCrcMismatch);
        }

        let mut nid = *header_bytes
            .first()
            .ok_or_else(|| Error::other("empty header"))?;
        if nid == K_ENCODED_HEADER {
            header_bytes =
                Self::read_encoded_header(&header_bytes[1..], reader, channel_size, options)?;
            nid = *header_bytes
                .first()
                .ok_or_else(|| Error::other("empty decoded header"))?;
        }
        if nid != K_HEADER {
            return Err(Error::other("Broken or unsupported archive: no Header"));
        }

        // Pass 1: validate the layout and check the memory estimate without
        // allocating archive structures.
        let mut cursor = Cursor::new(header_bytes.as_slice());
        cursor.set_position(1);
        sanity::check_header(&mut cursor, channel_size, options.max_memory_limit_kib)?;

        // Pass 2: materialise.
        let mut cursor = Cursor::new(header_bytes.as_slice());
        cursor.set_position(1);
        let mut archive = Archive::default();
        Self::read_header(&mut cursor, &mut archive)?;

        archive.is_solid = archive
            .blocks
            .iter()
            .any(|block| block.num_unpack_sub_streams > 1);

        if options.use_default_name_for_unnamed_entries {
            if let Some(default_name) = &options.default_name {
                for file in &mut archive.files {
                    if file.name.is_empty() {
                        file.name = default_name.clone();
                    }
                }
            }
        }

        Ok(archive)
    }

    /// Decodes a compressed header: `streams_info` describes a single block
    /// whose decoded output is the real header.
    fn read_encoded_header<R: Read + Seek>(
        streams_info: &[u8],
        reader: &mut R,
        channel_size: u64,
        options: &ReaderOptions,
    ) -> Result<Vec<u8>, Error> {
        let mut stats = sanity::ParseStats::default();
        sanity::check_streams_info(&mut Cursor::new(streams_info), channel_size, &mut stats)?;
        stats.assert_validity(options.max_memory_limit_kib)?;

        let mut archive = Archive::default();
        Self::read_streams_info(&mut Cursor::new(streams_info), &mut archive)?;
        let block = archive
            .blocks
            .first()
            .ok_or_else(|| Error::other("no blocks, can't read encoded header"))?;
        if archive.pack_sizes.is_empty() {
            return Err(Error::other("no packed streams, can't read encoded header"));
        }

        let unpack_size = block.unpack_size();
        let unpack_kib = unpack_size.div_ceil(1024) as usize;
        if unpack_kib > options.max_memory_limit_kib {
            return Err(Error::MaxMemLimited {
                max_kib: options.max_memory_limit_kib,
                required_kib: unpack_kib,
            });
        }
        let unpack_size = assert_usize(unpack_size, "header unpack size")?;

        let block_offset = SIGNATURE_HEADER_SIZE + archive.pack_pos;
        let pack_size = archive.pack_sizes[0];
        let source = SeekableBoundedReader::new(&mut *reader, (block_offset, block_offset + pack_size));
        let mut decoder: Box<dyn Read + '_> = Box::new(source);
        for (index, coder) in block.ordered_coder_iter() {
            if coder.num_in_streams != 1 || coder.num_out_streams != 1 {
                return Err(Error::unsupported(
                    "Multi input/output stream coders are not yet supported",
                ));
            }
            decoder = Box::new(add_decoder(
                decoder,
                block.unpack_size_at_index(index),
                coder,
                options,
            )?);
        }
        if block.has_crc {
            decoder = Box::new(Crc32VerifyingReader::new(
                decoder,
                unpack_size as u64,
                block.crc,
                || Error::BlockCrcMismatch,
            ));
        }

        let mut header = vec![0u8; unpack_size];
        decoder.read_exact(&mut header).map_err(Error::io)?;
        if block.has_crc {
            // One more read to trigger the deferred checksum verification.
            let mut sentinel = [0u8; 1];
            decoder.read(&mut sentinel).map_err(Error::io)?;
        }
        Ok(header)
    }

    fn read_header<R: Read + Seek>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        if nid == K_ARCHIVE_PROPERTIES {
            Self::read_archive_properties(header)?;
            nid = read_u8(header)?;
        }
        if nid == K_ADDITIONAL_STREAMS_INFO {
            return Err(Error::other("Additional streams unsupported"));
        }
        if nid == K_MAIN_STREAMS_INFO {
            Self::read_streams_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid == K_FILES_INFO {
            Self::read_files_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::BadTerminatedHeader(nid));
        }
        Ok(())
    }

    // Contents are undocumented, read and discard like the reference
    // implementation does.
    fn read_archive_properties<R: Read + Seek>(header: &mut R) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        while nid != K_END {
            let property_size = read_u64(header)?;
            header
                .seek(SeekFrom::Current(property_size as i64))
                .map_err(Error::io)?;
            nid = read_u8(header)?;
        }
        Ok(())
    }

    fn read_streams_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        if nid == K_PACK_INFO {
            Self::read_pack_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid == K_UNPACK_INFO {
            Self::read_unpack_info(header, archive)?;
            nid = read_u8(header)?;
        } else {
            archive.blocks.clear();
        }
        if nid == K_SUB_STREAMS_INFO {
            Self::read_sub_streams_info(header, archive)?;
            nid = read_u8(header)?;
        } else {
            // One implicit sub stream per block, sized and checksummed like
            // the block itself.
            let mut info = SubStreamsInfo::default();
            for (i, block) in archive.blocks.iter_mut().enumerate() {
                block.num_unpack_sub_streams = 1;
                info.unpack_sizes.push(block.unpack_size());
                if block.has_crc {
                    info.has_crc.insert(i);
                }
                info.crcs.push(block.crc);
            }
            if !archive.blocks.is_empty() {
                archive.sub_streams_info = Some(info);
            }
        }
        if nid != K_END {
            return Err(Error::BadTerminatedStreamsInfo(nid));
        }
        Ok(())
    }

    fn read_pack_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        archive.pack_pos = read_u64(header)?;
        let num_pack_streams = read_usize(header, "numPackStreams")?;
        let mut nid = read_u8(header)?;
        if nid == K_SIZE {
            archive.pack_sizes = Vec::with_capacity(num_pack_streams);
            for _ in 0..num_pack_streams {
                archive.pack_sizes.push(read_u64(header)?);
            }
            nid = read_u8(header)?;
        }
        if nid == K_CRC {
            archive.pack_crcs_defined = read_all_or_bits(header, num_pack_streams)?;
            archive.pack_crcs = vec![0; num_pack_streams];
            for i in 0..num_pack_streams {
                if archive.pack_crcs_defined.contains(i) {
                    archive.pack_crcs[i] = read_u32(header)?;
                }
            }
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::BadTerminatedPackInfo(nid));
        }
        Ok(())
    }

    fn read_unpack_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let nid = read_u8(header)?;
        if nid != K_FOLDER {
            return Err(Error::other(format!("Expected kFolder, got {nid}")));
        }
        let num_blocks = read_usize(header, "numBlocks")?;
        archive.blocks.reserve_exact(num_blocks);
        let external = read_u8(header)?;
        if external != 0 {
            return Err(Error::ExternalUnsupported);
        }
        for _ in 0..num_blocks {
            archive.blocks.push(Self::read_block(header)?);
        }

        let nid = read_u8(header)?;
        if nid != K_CODERS_UNPACK_SIZE {
            return Err(Error::other(format!("Expected kCodersUnpackSize, got {nid}")));
        }
        for block in archive.blocks.iter_mut() {
            let total_output_streams = block.total_output_streams;
            block.unpack_sizes.reserve_exact(total_output_streams);
            for _ in 0..total_output_streams {
                block.unpack_sizes.push(read_u64(header)?);
            }
        }

        let mut nid = read_u8(header)?;
        if nid == K_CRC {
            let crcs_defined = read_all_or_bits(header, num_blocks)?;
            for (i, block) in archive.blocks.iter_mut().enumerate() {
                block.has_crc = crcs_defined.contains(i);
                if block.has_crc {
                    block.crc = read_u32(header)?;
                }
            }
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::BadTerminatedUnpackInfo);
        }
        Ok(())
    }

    fn read_block<R: Read>(header: &mut R) -> Result<Block, Error> {
        let mut block = Block::default();

        let num_coders = read_usize(header, "numCoders")?;
        let mut coders = Vec::with_capacity(num_coders);
        let mut total_in_streams = 0u64;
        let mut total_out_streams = 0u64;
        for _ in 0..num_coders {
            let mut coder = Coder::default();
            let flags = read_u8(header)?;
            let id_len = (flags & 0xF) as usize;
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
            coder.id_len = id_len;
            header.read_exact(coder.method_id_mut()).map_err(Error::io)?;
            if is_simple {
                coder.num_in_streams = 1;
                coder.num_out_streams = 1;
            } else {
                coder.num_in_streams = read_u64(header)?;
                coder.num_out_streams = read_u64(header)?;
            }
            total_in_streams += coder.num_in_streams;
            total_out_streams += coder.num_out_streams;
            if has_attributes {
                let properties_size = read_usize(header, "coder properties size")?;
                let mut properties = vec![0u8; properties_size];
                header.read_exact(&mut properties).map_err(Error::io)?;
                coder.properties = properties;
            }
            coders.push(coder);
        }
        block.coders = coders;
        let total_in_streams = assert_usize(total_in_streams, "totalInStreams")?;
        let total_out_streams = assert_usize(total_out_streams, "totalOutStreams")?;
        block.total_input_streams = total_in_streams;
        block.total_output_streams = total_out_streams;

        if total_out_streams == 0 {
            return Err(Error::other("Total output streams can't be 0"));
        }
        let num_bind_pairs = total_out_streams - 1;
        let mut bind_pairs = Vec::with_capacity(num_bind_pairs);
        for _ in 0..num_bind_pairs {
            bind_pairs.push(BindPair {
                in_index: read_u64(header)?,
                out_index: read_u64(header)?,
            });
        }
        block.bind_pairs = bind_pairs;

        if total_in_streams < num_bind_pairs {
            return Err(Error::other(
                "Total input streams can't be less than the number of bind pairs",
            ));
        }
        let num_packed_streams = total_in_streams - num_bind_pairs;
        let mut packed_streams = vec![0u64; num_packed_streams];
        if num_packed_streams == 1 {
            let index = (0..total_in_streams)
                .find(|&i| block.find_bind_pair_for_in_stream(i).is_none())
                .ok_or_else(|| Error::other("Couldn't find stream's bind pair index"))?;
            packed_streams[0] = index as u64;
        } else {
            for packed_stream in packed_streams.iter_mut() {
                *packed_stream = read_u64(header)?;
            }
        }
        block.packed_streams = packed_streams;

        Ok(block)
    }

    fn read_sub_streams_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        for block in archive.blocks.iter_mut() {
            block.num_unpack_sub_streams = 1;
        }
        let mut total_unpack_streams = archive.blocks.len();

        let mut nid = read_u8(header)?;
        if nid == K_NUM_UNPACK_STREAM {
            total_unpack_streams = 0;
            for block in archive.blocks.iter_mut() {
                let num_streams = read_usize(header, "numStreams")?;
                block.num_unpack_sub_streams = num_streams;
                total_unpack_streams += num_streams;
            }
            nid = read_u8(header)?;
        }

        let mut info = SubStreamsInfo {
            unpack_sizes: vec![0; total_unpack_streams],
            has_crc: BitSet::with_capacity(total_unpack_streams),
            crcs: vec![0; total_unpack_streams],
        };

        let mut next_unpack_stream = 0;
        for block in archive.blocks.iter() {
            if block.num_unpack_sub_streams == 0 {
                continue;
            }
            let mut sum = 0;
            if nid == K_SIZE {
                for _ in 0..block.num_unpack_sub_streams - 1 {
                    let size = read_u64(header)?;
                    info.unpack_sizes[next_unpack_stream] = size;
                    next_unpack_stream += 1;
                    sum += size;
                }
            }
            if sum > block.unpack_size() {
                return Err(Error::other(
                    "sum of unpack sizes of block exceeds total unpack size",
                ));
            }
            info.unpack_sizes[next_unpack_stream] = block.unpack_size() - sum;
            next_unpack_stream += 1;
        }
        if nid == K_SIZE {
            nid = read_u8(header)?;
        }

        let mut num_digests = 0;
        for block in archive.blocks.iter() {
            if block.num_unpack_sub_streams != 1 || !block.has_crc {
                num_digests += block.num_unpack_sub_streams;
            }
        }

        if nid == K_CRC {
            let digests_defined = read_all_or_bits(header, num_digests)?;
            let mut digests = vec![0u32; num_digests];
            for (i, digest) in digests.iter_mut().enumerate() {
                if digests_defined.contains(i) {
                    *digest = read_u32(header)?;
                }
            }
            let mut next_crc = 0;
            let mut next_digest = 0;
            for block in archive.blocks.iter() {
                if block.num_unpack_sub_streams == 1 && block.has_crc {
                    info.has_crc.insert(next_crc);
                    info.crcs[next_crc] = block.crc;
                    next_crc += 1;
                } else {
                    for _ in 0..block.num_unpack_sub_streams {
                        if digests_defined.contains(next_digest) {
                            info.has_crc.insert(next_crc);
                        }
                        info.crcs[next_crc] = digests[next_digest];
                        next_crc += 1;
                        next_digest += 1;
                    }
                }
            }
            nid = read_u8(header)?;
        } else {
            // Block level CRCs still cover single sub stream blocks.
            let mut next_crc = 0;
            for block in archive.blocks.iter() {
                if block.num_unpack_sub_streams == 1 && block.has_crc {
                    info.has_crc.insert(next_crc);
                    info.crcs[next_crc] = block.crc;
                }
                next_crc += block.num_unpack_sub_streams;
            }
        }

        if nid != K_END {
            return Err(Error::BadTerminatedSubStreamsInfo);
        }
        archive.sub_streams_info = Some(info);
        Ok(())
    }

    fn read_files_info<R: Read + Seek>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let num_files = read_usize(header, "numFiles")?;
        let mut files: Vec<ArchiveEntry> = vec![Default::default(); num_files];

        let mut is_empty_stream: Option<BitSet> = None;
        let mut is_empty_file: Option<BitSet> = None;
        let mut is_anti: Option<BitSet> = None;
        loop {
            let property_type = read_u8(header)?;
            if property_type == K_END {
                break;
            }
            let size = read_u64(header)?;
            match property_type {
                K_EMPTY_STREAM => {
                    is_empty_stream = Some(read_bits(header, num_files)?);
                }
                K_EMPTY_FILE => {
                    let count = is_empty_stream.as_ref().map(BitSet::len).ok_or_else(|| {
                        Error::other(
                            "Header format error: kEmptyStream must appear before kEmptyFile",
                        )
                    })?;
                    is_empty_file = Some(read_bits(header, count)?);
                }
                K_ANTI => {
                    let count = is_empty_stream.as_ref().map(BitSet::len).ok_or_else(|| {
                        Error::other("Header format error: kEmptyStream must appear before kAnti")
                    })?;
                    is_anti = Some(read_bits(header, count)?);
                }
                K_NAME => {
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::ExternalUnsupported);
                    }
                    if size == 0 || (size - 1) & 1 != 0 {
                        return Err(Error::other("file names length invalid"));
                    }
                    let names_len = assert_usize(size - 1, "file names length")?;
                    let mut next_file = 0;
                    for name in NamesReader::new(header, names_len) {
                        let name = name?;
                        if next_file >= files.len() {
                            return Err(Error::other("Error parsing file names"));
                        }
                        files[next_file].name = name;
                        next_file += 1;
                    }
                    if next_file != files.len() {
                        return Err(Error::other("Error parsing file names"));
                    }
                }
                K_C_TIME => {
                    let times_defined = read_all_or_bits(header, num_files)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::ExternalUnsupported);
                    }
                    for (i, file) in files.iter_mut().enumerate() {
                        file.has_creation_date = times_defined.contains(i);
                        if file.has_creation_date {
                            file.creation_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_A_TIME => {
                    let times_defined = read_all_or_bits(header, num_files)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::ExternalUnsupported);
                    }
                    for (i, file) in files.iter_mut().enumerate() {
                        file.has_access_date = times_defined.contains(i);
                        if file.has_access_date {
                            file.access_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_M_TIME => {
                    let times_defined = read_all_or_bits(header, num_files)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::ExternalUnsupported);
                    }
                    for (i, file) in files.iter_mut().enumerate() {
                        file.has_last_modified_date = times_defined.contains(i);
                        if file.has_last_modified_date {
                            file.last_modified_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_WIN_ATTRIBUTES => {
                    let attributes_defined = read_all_or_bits(header, num_files)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::ExternalUnsupported);
                    }
                    for (i, file) in files.iter_mut().enumerate() {
                        file.has_windows_attributes = attributes_defined.contains(i);
                        if file.has_windows_attributes {
                            file.windows_attributes = read_u32(header)?;
                        }
                    }
                }
                K_START_POS => {
                    return Err(Error::other("kStartPos is unsupported, please report"));
                }
                _ => {
                    // kDummy padding and unknown future properties.
                    header
                        .seek(SeekFrom::Current(size as i64))
                        .map_err(Error::io)?;
                }
            }
        }

        let mut non_empty_file_counter = 0;
        let mut empty_file_counter = 0;
        for (i, file) in files.iter_mut().enumerate() {
            file.has_stream = is_empty_stream
                .as_ref()
                .map(|s| !s.contains(i))
                .unwrap_or(true);
            if file.has_stream {
                let sub_streams_info = archive.sub_streams_info.as_ref().ok_or_else(|| {
                    Error::other("Archive contains file with streams but no subStreamsInfo")
                })?;
                if non_empty_file_counter >= sub_streams_info.unpack_sizes.len() {
                    return Err(Error::other(
                        "Archive doesn't contain enough sub streams for entries",
                    ));
                }
                file.is_directory = false;
                file.is_anti_item = false;
                file.has_crc = sub_streams_info.has_crc.contains(non_empty_file_counter);
                file.crc = sub_streams_info.crcs[non_empty_file_counter];
                file.size = sub_streams_info.unpack_sizes[non_empty_file_counter];
                non_empty_file_counter += 1;
            } else {
                file.is_directory = match &is_empty_file {
                    Some(s) => !s.contains(empty_file_counter),
                    None => true,
                };
                file.is_anti_item = is_anti
                    .as_ref()
                    .map(|s| s.contains(empty_file_counter))
                    .unwrap_or(false);
                file.has_crc = false;
                file.size = 0;
                empty_file_counter += 1;
            }
        }
        archive.files = files;

        Self::calculate_stream_map(archive)
    }

    fn calculate_stream_map(archive: &mut Archive) -> Result<(), Error> {
        let mut stream_map = StreamMap::default();

        let num_blocks = archive.blocks.len();
        let mut next_pack_stream_index = 0;
        stream_map.block_first_pack_stream_index = Vec::with_capacity(num_blocks);
        for block in &archive.blocks {
            stream_map
                .block_first_pack_stream_index
                .push(next_pack_stream_index);
            next_pack_stream_index += block.packed_streams.len();
        }

        let mut next_pack_stream_offset = 0;
        stream_map.pack_stream_offsets = Vec::with_capacity(archive.pack_sizes.len());
        for pack_size in &archive.pack_sizes {
            stream_map.pack_stream_offsets.push(next_pack_stream_offset);
            next_pack_stream_offset += pack_size;
        }

        stream_map.block_first_file_index = vec![0; num_blocks];
        stream_map.file_block_index = vec![None; archive.files.len()];
        let mut next_block_index = 0;
        let mut next_block_unpack_stream_index = 0;
        for i in 0..archive.files.len() {
            if !archive.files[i].has_stream && next_block_unpack_stream_index == 0 {
                stream_map.file_block_index[i] = None;
                continue;
            }
            if next_block_unpack_stream_index == 0 {
                while next_block_index < archive.blocks.len() {
                    stream_map.block_first_file_index[next_block_index] = i;
                    if archive.blocks[next_block_index].num_unpack_sub_streams > 0 {
                        break;
                    }
                    next_block_index += 1;
                }
                if next_block_index >= archive.blocks.len() {
                    return Err(Error::other("Too few blocks in archive"));
                }
            }
            stream_map.file_block_index[i] = Some(next_block_index);
            if !archive.files[i].has_stream {
                continue;
            }

            // The size of the block's pack stream is reported on its first
            // entry.
            if stream_map.block_first_file_index[next_block_index] == i {
                let first_pack_stream_index =
                    stream_map.block_first_pack_stream_index[next_block_index];
                archive.files[i].compressed_size = archive.pack_sizes[first_pack_stream_index];
            }

            next_block_unpack_stream_index += 1;
            if next_block_unpack_stream_index
                >= archive.blocks[next_block_index].num_unpack_sub_streams
            {
                next_block_index += 1;
                next_block_unpack_stream_index = 0;
            }
        }

        archive.stream_map = stream_map;
        Ok(())
    }
}

#[inline]
pub(crate) fn read_usize<R: Read>(reader: &mut R, field: &str) -> Result<usize, Error> {
    let size = read_u64(reader)?;
    assert_usize(size, field)
}

#[inline]
pub(crate) fn assert_usize(size: u64, field: &str) -> Result<usize, Error> {
    if size > usize::MAX as u64 {
        return Err(Error::other(format!("Cannot handle {field} {size}")));
    }
    Ok(size as usize)
}

#[inline]
pub(crate) fn read_u64le<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf).map_err(Error::io)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads a 7z variable length integer: the number of leading one bits of the
/// first byte selects how many little-endian low bytes follow, the remaining
/// bits of the first byte become the high bits of the value.
pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let first = read_u8(reader)? as u64;
    let mut mask = 0x80_u64;
    let mut value = 0;
    for i in 0..8 {
        if (first & mask) == 0 {
            return Ok(value | ((first & (mask - 1)) << (8 * i)));
        }
        let b = read_u8(reader)? as u64;
        value |= b << (8 * i);
        mask >>= 1;
    }
    Ok(value)
}

#[inline(always)]
pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf).map_err(Error::io)?;
    Ok(u32::from_le_bytes(buf))
}

#[inline(always)]
pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8, Error> {
    let mut buf = [0];
    reader.read_exact(&mut buf).map_err(Error::io)?;
    Ok(buf[0])
}

pub(crate) fn read_all_or_bits<R: Read>(header: &mut R, size: usize) -> Result<BitSet, Error> {
    let all_defined = read_u8(header)?;
    if all_defined != 0 {
        Ok(BitSet::filled(size))
    } else {
        read_bits(header, size)
    }
}

pub(crate) fn read_bits<R: Read>(header: &mut R, size: usize) -> Result<BitSet, Error> {
    let mut bits = BitSet::with_capacity(size);
    let mut mask = 0u32;
    let mut cache = 0u32;
    for i in 0..size {
        if mask == 0 {
            mask = 0x80;
            cache = read_u8(header)? as u32;
        }
        if (cache & mask) != 0 {
            bits.insert(i);
        }
        mask >>= 1;
    }
    Ok(bits)
}

/// Iterator over the null-terminated UTF-16LE names of a `kName` block.
struct NamesReader<'a, R: Read> {
    max_bytes: usize,
    read_bytes: usize,
    cache: Vec<u16>,
    reader: &'a mut R,
}

impl<'a, R: Read> NamesReader<'a, R> {
    fn new(reader: &'a mut R, max_bytes: usize) -> Self {
        Self {
            max_bytes,
            reader,
            read_bytes: 0,
            cache: Vec::with_capacity(16),
        }
    }
}

impl<R: Read> Iterator for NamesReader<'_, R> {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read_bytes >= self.max_bytes {
            return None;
        }
        self.cache.clear();
        let mut buf = [0; 2];
        while self.read_bytes < self.max_bytes {
            if let Err(e) = self.reader.read_exact(&mut buf).map_err(Error::io) {
                return Some(Err(e));
            }
            self.read_bytes += 2;
            let unit = u16::from_le_bytes(buf);
            if unit == 0 {
                break;
            }
            self.cache.push(unit);
        }
        Some(String::from_utf16(&self.cache).map_err(|e| Error::other(e.to_string())))
    }
}

/// A cloneable, owning handle to the archive's underlying channel.
///
/// The reader exclusively owns the channel; every decode stack built for a
/// block holds a clone of this handle.
#[derive(Debug)]
pub(crate) struct SourceHandle<R>(Rc<RefCell<R>>);

impl<R> SourceHandle<R> {
    fn new(source: R) -> Self {
        Self(Rc::new(RefCell::new(source)))
    }
}

impl<R> Clone for SourceHandle<R> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<R: Read> Read for SourceHandle<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl<R: Seek> Seek for SourceHandle<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

/// Composes the decoder stack for one block: the bounded pack stream, an
/// optional pack CRC shim, a byte counter, the block's coders in decoding
/// order and finally the block CRC shim.
fn build_block_stream<'s, S: Read + Seek + 's>(
    mut source: S,
    archive: &Archive,
    block_index: usize,
    options: &ReaderOptions,
) -> Result<(Box<dyn Read + 's>, Rc<Cell<u64>>), Error> {
    let block = archive
        .blocks
        .get(block_index)
        .ok_or_else(|| Error::other("block index out of range"))?;
    let first_pack_stream_index = *archive
        .stream_map
        .block_first_pack_stream_index
        .get(block_index)
        .ok_or_else(|| Error::other("block has no pack stream"))?;
    let pack_size = *archive
        .pack_sizes
        .get(first_pack_stream_index)
        .ok_or_else(|| Error::other("missing pack stream size"))?;
    let block_offset = SIGNATURE_HEADER_SIZE
        + archive.pack_pos
        + archive.stream_map.pack_stream_offsets[first_pack_stream_index];

    source.seek(SeekFrom::Start(block_offset)).map_err(Error::io)?;
    let bounded = BoundedReader::new(source, pack_size);
    let mut reader: Box<dyn Read + 's> = if archive.pack_crcs_defined.contains(first_pack_stream_index)
    {
        Box::new(Crc32VerifyingReader::new(
            bounded,
            pack_size,
            archive.pack_crcs[first_pack_stream_index],
            || Error::PackCrcMismatch,
        ))
    } else {
        Box::new(bounded)
    };

    let counting = CountingReader::new(reader);
    let counter = counting.counter();
    reader = Box::new(counting);

    for (index, coder) in block.ordered_coder_iter() {
        if coder.num_in_streams != 1 || coder.num_out_streams != 1 {
            return Err(Error::unsupported(
                "Multi input/output stream coders are not yet supported",
            ));
        }
        reader = Box::new(add_decoder(
            reader,
            block.unpack_size_at_index(index),
            coder,
            options,
        )?);
    }
    if block.has_crc {
        reader = Box::new(Crc32VerifyingReader::new(
            reader,
            block.unpack_size(),
            block.crc,
            || Error::BlockCrcMismatch,
        ));
    }
    Ok((reader, counter))
}

/// Cursor state of an [`ArchiveReader`]: the currently open block stream and
/// how far it has been consumed.
struct EntryCursor {
    open_block: Option<usize>,
    block_stream: Option<Box<dyn Read>>,
    compressed_counter: Option<Rc<Cell<u64>>>,
    /// File index whose bytes are next on the block stream.
    stream_file: usize,
    /// Bytes of `stream_file`'s entry already taken off the stream.
    consumed: u64,
    digest: Hasher,
    remaining_sub_streams: usize,
    /// The entry the reader API currently points at.
    current_file: Option<usize>,
    /// Iteration position of [`ArchiveReader::next_entry`].
    next_file: usize,
}

impl EntryCursor {
    fn new() -> Self {
        Self {
            open_block: None,
            block_stream: None,
            compressed_counter: None,
            stream_file: 0,
            consumed: 0,
            digest: Hasher::new(),
            remaining_sub_streams: 0,
            current_file: None,
            next_file: 0,
        }
    }

    fn invalidate(&mut self) {
        self.open_block = None;
        self.block_stream = None;
        self.compressed_counter = None;
        self.consumed = 0;
        self.digest = Hasher::new();
        self.remaining_sub_streams = 0;
    }
}

/// Reads the entries of a 7z archive.
///
/// The reader owns its channel and offers three access styles:
///
/// * a sequential cursor ([`next_entry`](Self::next_entry) plus the [`Read`]
///   impl),
/// * random access ([`entry_reader`](Self::entry_reader),
///   [`read_file`](Self::read_file)),
/// * bulk iteration ([`for_each_entries`](Self::for_each_entries)).
///
/// Random access into a solid block cannot seek on the decoded stream: when
/// the wanted entry lies before the cursor (or the current entry was already
/// partially read) the block is reopened from its first pack byte and every
/// preceding entry is streamed and discarded.
pub struct ArchiveReader<R: Read + Seek> {
    source: SourceHandle<R>,
    archive: Archive,
    options: ReaderOptions,
    index: HashMap<String, usize>,
    cursor: EntryCursor,
}

impl ArchiveReader<File> {
    /// Opens the 7z file at `path`.
    ///
    /// When [`ReaderOptions::with_use_default_name_for_unnamed_entries`] is
    /// enabled and no default name was configured, the file stem of `path`
    /// is used.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        mut options: ReaderOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        if options.use_default_name_for_unnamed_entries && options.default_name.is_none() {
            options.default_name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        let file = File::open(path)
            .map_err(|e| Error::file_open(e, path.to_string_lossy().to_string()))?;
        Self::new_with_options(file, options)
    }
}

impl<R: Read + Seek + 'static> ArchiveReader<R> {
    /// Creates an [`ArchiveReader`] from the given channel.
    #[inline]
    pub fn new(source: R) -> Result<Self, Error> {
        Self::new_with_options(source, ReaderOptions::default())
    }

    /// Creates an [`ArchiveReader`] with explicit [`ReaderOptions`].
    pub fn new_with_options(mut source: R, options: ReaderOptions) -> Result<Self, Error> {
        let archive = Archive::read_with_options(&mut source, &options)?;
        Ok(Self::from_archive(archive, source, options))
    }

    /// Creates an [`ArchiveReader`] from an already parsed [`Archive`],
    /// avoiding a second parse of the metadata.
    pub fn from_archive(archive: Archive, source: R, options: ReaderOptions) -> Self {
        let mut reader = Self {
            source: SourceHandle::new(source),
            archive,
            options,
            index: HashMap::new(),
            cursor: EntryCursor::new(),
        };
        for (file_index, file) in reader.archive.files.iter().enumerate() {
            reader.index.insert(file.name.clone(), file_index);
        }
        reader
    }

    /// Returns the parsed [`Archive`] structure.
    #[inline]
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Returns all entries of the archive.
    #[inline]
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.archive.files
    }

    /// Advances the cursor to the next entry and returns it.
    ///
    /// The content of the entry is then available through the [`Read`] impl.
    /// Unread content of the previous entry is skipped lazily when reading
    /// continues.
    pub fn next_entry(&mut self) -> Option<&ArchiveEntry> {
        let file_index = self.cursor.next_file;
        if file_index >= self.archive.files.len() {
            self.cursor.current_file = None;
            return None;
        }
        self.cursor.next_file += 1;
        self.cursor.current_file = Some(file_index);
        Some(&self.archive.files[file_index])
    }

    /// Returns a reader over the content of the entry at `index`.
    ///
    /// Entries between the cursor and `index` are streamed and discarded,
    /// never materialised. Requesting an entry behind the cursor, or one in
    /// another block, reopens the block from its first pack byte. The
    /// returned reader borrows the archive reader, so obtaining a new one
    /// invalidates the previous one.
    pub fn entry_reader(&mut self, index: usize) -> Result<EntryReader<'_, R>, Error> {
        let file = self
            .archive
            .files
            .get(index)
            .ok_or_else(|| Error::other("entry index out of range"))?;
        if file.has_stream && file.size > 0 {
            let block_index = self.archive.stream_map.file_block_index[index]
                .ok_or_else(|| Error::other("entry has no associated block"))?;
            let reusable = self.cursor.open_block == Some(block_index)
                && self.cursor.block_stream.is_some()
                && index >= self.cursor.stream_file
                && self.cursor.consumed == 0;
            if !reusable {
                self.open_block(block_index)?;
            }
        }
        self.cursor.current_file = Some(index);
        self.cursor.next_file = index + 1;
        Ok(EntryReader { reader: self })
    }

    /// Returns the content of the entry with the given `name`.
    ///
    /// In a solid archive this decodes and discards all data stored before
    /// the entry inside its block.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let file_index = *self.index.get(name).ok_or(Error::FileNotFound)?;
        let size = self.archive.files[file_index].size;
        let mut content = Vec::with_capacity(size.min(1 << 16) as usize);
        self.entry_reader(file_index)?
            .read_to_end(&mut content)
            .map_err(Error::io)?;
        Ok(content)
    }

    /// Returns the coder pipeline methods of the named entry.
    pub fn entry_compression_methods(&self, name: &str) -> Result<Vec<CoderMethod>, Error> {
        let file_index = *self.index.get(name).ok_or(Error::FileNotFound)?;
        let Some(block_index) = self.archive.stream_map.file_block_index[file_index] else {
            return Ok(Vec::new());
        };
        Ok(self.archive.blocks[block_index]
            .ordered_coder_iter()
            .filter_map(|(_, coder)| CoderMethod::by_id(coder.method_id()))
            .collect())
    }

    /// Calls `each` for every entry of the archive with a reader over its
    /// content. Returning `Ok(false)` stops the iteration.
    ///
    /// Entries are visited block by block, so in a solid archive every
    /// entry's data is decoded exactly once.
    pub fn for_each_entries<F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<bool, Error>>(
        &mut self,
        mut each: F,
    ) -> Result<(), Error> {
        self.cursor.invalidate();
        {
            let mut source = self.source.0.borrow_mut();
            for block_index in 0..self.archive.blocks.len() {
                let decoder =
                    BlockDecoder::new(block_index, &self.archive, &self.options, &mut *source);
                if !decoder.for_each_entries(&mut each)? {
                    return Ok(());
                }
            }
        }
        for file_index in 0..self.archive.files.len() {
            if self.archive.stream_map.file_block_index[file_index].is_none() {
                let file = &self.archive.files[file_index];
                let empty_reader: &mut dyn Read = &mut [0u8; 0].as_slice();
                if !each(file, empty_reader)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Bytes of compressed data consumed so far for the currently open
    /// block.
    pub fn compressed_bytes_read(&self) -> u64 {
        self.cursor
            .compressed_counter
            .as_ref()
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    fn open_block(&mut self, block_index: usize) -> Result<(), Error> {
        self.cursor.invalidate();
        let (stream, counter) =
            build_block_stream(self.source.clone(), &self.archive, block_index, &self.options)?;

        let block = &self.archive.blocks[block_index];
        let methods: Vec<CoderMethod> = block
            .ordered_coder_iter()
            .filter_map(|(_, coder)| CoderMethod::by_id(coder.method_id()))
            .collect();
        let block_files: Vec<usize> = self
            .archive
            .stream_map
            .file_block_index
            .iter()
            .enumerate()
            .filter(|(_, block_of_file)| **block_of_file == Some(block_index))
            .map(|(file_index, _)| file_index)
            .collect();
        for file_index in block_files {
            self.archive.files[file_index].content_methods = Some(methods.clone());
        }

        self.cursor.block_stream = Some(stream);
        self.cursor.compressed_counter = Some(counter);
        self.cursor.open_block = Some(block_index);
        self.cursor.stream_file = self.archive.stream_map.block_first_file_index[block_index];
        self.cursor.remaining_sub_streams =
            self.archive.blocks[block_index].num_unpack_sub_streams;
        Ok(())
    }

    /// Verifies the finished entry at the stream head and advances past it.
    fn complete_stream_entry(&mut self) -> std::io::Result<()> {
        let file_index = self.cursor.stream_file;
        let (has_crc, crc, has_stream) = {
            let file = &self.archive.files[file_index];
            (file.has_crc, file.crc, file.has_stream)
        };
        let digest = std::mem::replace(&mut self.cursor.digest, Hasher::new());
        if has_crc && digest.finalize() != crc {
            self.cursor.invalidate();
            return Err(std::io::Error::other(Error::EntryCrcMismatch));
        }
        self.cursor.stream_file += 1;
        self.cursor.consumed = 0;
        if has_stream {
            self.cursor.remaining_sub_streams =
                self.cursor.remaining_sub_streams.saturating_sub(1);
            if self.cursor.remaining_sub_streams == 0 {
                self.poke_block_checksum()?;
            }
        }
        Ok(())
    }

    /// The block checksum shim verifies lazily on the read after the last
    /// byte; issue that read once the block is fully consumed.
    fn poke_block_checksum(&mut self) -> std::io::Result<()> {
        let has_crc = self
            .cursor
            .open_block
            .map(|block_index| self.archive.blocks[block_index].has_crc)
            .unwrap_or(false);
        if !has_crc {
            return Ok(());
        }
        if let Some(stream) = self.cursor.block_stream.as_mut() {
            let mut sentinel = [0u8; 1];
            if stream.read(&mut sentinel)? != 0 {
                return Err(std::io::Error::other(Error::other(
                    "block stream is longer than declared",
                )));
            }
        }
        Ok(())
    }

    /// Streams and discards the entry at the stream head.
    fn skip_stream_entry(&mut self) -> std::io::Result<()> {
        let file_index = self.cursor.stream_file;
        let size = {
            let file = &self.archive.files[file_index];
            if file.has_stream { file.size } else { 0 }
        };
        let mut scratch = [0u8; 8192];
        while self.cursor.consumed < size {
            let limit = (size - self.cursor.consumed).min(scratch.len() as u64) as usize;
            let Some(stream) = self.cursor.block_stream.as_mut() else {
                return Err(std::io::Error::other(Error::other("no open block stream")));
            };
            let n = stream.read(&mut scratch[..limit])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "entry data ended before its declared size",
                ));
            }
            self.cursor.digest.update(&scratch[..n]);
            self.cursor.consumed += n as u64;
        }
        self.complete_stream_entry()
    }

    fn read_current(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(file_index) = self.cursor.current_file else {
            return Ok(0);
        };
        let (has_stream, size) = {
            let file = &self.archive.files[file_index];
            (file.has_stream, file.size)
        };
        if !has_stream || size == 0 {
            return Ok(0);
        }
        let Some(block_index) = self.archive.stream_map.file_block_index[file_index] else {
            return Ok(0);
        };
        if self.cursor.open_block != Some(block_index) || self.cursor.block_stream.is_none() {
            self.open_block(block_index)?;
        }
        if self.cursor.stream_file > file_index {
            // Already fully consumed and verified.
            return Ok(0);
        }
        while self.cursor.stream_file < file_index {
            self.skip_stream_entry()?;
        }
        if self.cursor.consumed >= size {
            self.complete_stream_entry()?;
            return Ok(0);
        }
        let limit = (size - self.cursor.consumed).min(buf.len() as u64) as usize;
        let Some(stream) = self.cursor.block_stream.as_mut() else {
            return Err(std::io::Error::other(Error::other("no open block stream")));
        };
        let n = stream.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "entry data ended before its declared size",
            ));
        }
        self.cursor.digest.update(&buf[..n]);
        self.cursor.consumed += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek + 'static> Read for ArchiveReader<R> {
    /// Reads from the entry the cursor points at, see
    /// [`next_entry`](Self::next_entry).
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_current(buf)
    }
}

/// Reader over the content of a single entry, borrowed from an
/// [`ArchiveReader`].
pub struct EntryReader<'a, R: Read + Seek> {
    reader: &'a mut ArchiveReader<R>,
}

impl<R: Read + Seek + 'static> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read_current(buf)
    }
}

/// Decodes the entries of a single block.
///
/// Useful for driving one block at a time; [`ArchiveReader`] covers the
/// common cases.
pub struct BlockDecoder<'a, R: Read + Seek> {
    block_index: usize,
    archive: &'a Archive,
    options: &'a ReaderOptions,
    source: &'a mut R,
}

impl<'a, R: Read + Seek> BlockDecoder<'a, R> {
    /// Creates a decoder for the block at `block_index`.
    pub fn new(
        block_index: usize,
        archive: &'a Archive,
        options: &'a ReaderOptions,
        source: &'a mut R,
    ) -> Self {
        Self {
            block_index,
            archive,
            options,
            source,
        }
    }

    /// Returns the number of entries stored in this block.
    pub fn entry_count(&self) -> usize {
        self.archive.blocks[self.block_index].num_unpack_sub_streams
    }

    /// Calls `each` for every entry of this block in stream order.
    ///
    /// Entries share the block's decoded stream; content not consumed by the
    /// closure is skipped before the next entry is delivered, and skipped
    /// content is checksummed all the same.
    pub fn for_each_entries<F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<bool, Error>>(
        self,
        each: &mut F,
    ) -> Result<bool, Error> {
        let Self {
            block_index,
            archive,
            options,
            source,
        } = self;
        let (mut block_reader, _counter) =
            build_block_stream(&mut *source, archive, block_index, options)?;

        let mut sub_streams_remaining = archive.blocks[block_index].num_unpack_sub_streams;
        let mut file_index = archive.stream_map.block_first_file_index[block_index];
        while sub_streams_remaining > 0 && file_index < archive.files.len() {
            let file = &archive.files[file_index];
            if file.has_stream && file.size > 0 {
                let bounded = BoundedReader::new(&mut block_reader, file.size);
                let mut entry_reader: Box<dyn Read + '_> = if file.has_crc {
                    Box::new(Crc32VerifyingReader::new(bounded, file.size, file.crc, || {
                        Error::EntryCrcMismatch
                    }))
                } else {
                    Box::new(bounded)
                };
                let keep_going = each(file, &mut entry_reader)?;
                // Drain whatever the closure left so the next entry starts
                // aligned and the checksum is verified either way.
                std::io::copy(&mut entry_reader, &mut std::io::sink()).map_err(Error::io)?;
                if !keep_going {
                    return Ok(false);
                }
            } else {
                let empty_reader: &mut dyn Read = &mut [0u8; 0].as_slice();
                if !each(file, empty_reader)? {
                    return Ok(false);
                }
            }
            if file.has_stream {
                sub_streams_remaining -= 1;
            }
            file_index += 1;
        }

        if archive.blocks[block_index].has_crc {
            let mut sentinel = [0u8; 1];
            if block_reader.read(&mut sentinel).map_err(Error::io)? != 0 {
                return Err(Error::other("block stream is longer than declared"));
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_single_byte() {
        assert_eq!(read_u64(&mut [0x27].as_slice()).unwrap(), 0x27);
        assert_eq!(read_u64(&mut [0x7F].as_slice()).unwrap(), 0x7F);
    }

    #[test]
    fn varint_prefix_bits_become_high_bits() {
        // 0xA7 = 1 length bit + high bits 0x27, low byte 0x10.
        assert_eq!(read_u64(&mut [0xA7, 0x10].as_slice()).unwrap(), 0x2710);
        // Two continuation bits.
        assert_eq!(
            read_u64(&mut [0xC1, 0x34, 0x12].as_slice()).unwrap(),
            0x1_1234
        );
    }

    #[test]
    fn varint_full_width() {
        let encoded = [0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(
            read_u64(&mut encoded.as_slice()).unwrap(),
            0x0807060504030201
        );
    }

    #[test]
    fn bounded_reader_stops_at_limit() {
        let mut reader = BoundedReader::new([1u8, 2, 3, 4].as_slice(), 3);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, [1, 2, 3]);
    }

    #[test]
    fn crc_reader_defers_mismatch_to_the_following_read() {
        let data = *b"Hello";
        let mut reader = Crc32VerifyingReader::new(data.as_slice(), 5, 0xDEADBEEF, || {
            Error::EntryCrcMismatch
        });
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Hello");
        let e = reader.read(&mut buf).unwrap_err();
        assert!(matches!(Error::io(e), Error::EntryCrcMismatch));
    }

    #[test]
    fn crc_reader_accepts_matching_checksum() {
        let data = *b"Hello";
        let crc = crc32fast::hash(&data);
        let mut reader =
            Crc32VerifyingReader::new(data.as_slice(), 5, crc, || Error::EntryCrcMismatch);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"Hello");
    }

    #[test]
    fn crc_reader_rejects_short_streams() {
        let data = *b"Hel";
        let crc = crc32fast::hash(b"Hello");
        let mut reader =
            Crc32VerifyingReader::new(data.as_slice(), 5, crc, || Error::EntryCrcMismatch);
        let mut content = Vec::new();
        let e = reader.read_to_end(&mut content).unwrap_err();
        assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
