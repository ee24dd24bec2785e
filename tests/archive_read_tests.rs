use std::io::{Cursor, Read};

use sevenz_stream::{Archive, ArchiveReader, Error, Password, ReaderOptions};

// ---------------------------------------------------------------------------
// In-memory archive construction. The format is simple enough to assemble by
// hand, which keeps the tests free of binary fixtures.
// ---------------------------------------------------------------------------

/// Encodes a 7z variable length integer.
fn varint(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for k in 0u32..8 {
        if value < 1u64 << (7 * (k + 1)) {
            let ones = ((0xFF00u16 >> k) & 0xFF) as u8;
            let high = (value >> (8 * k)) as u8;
            out.push(ones | high);
            for i in 0..k {
                out.push((value >> (8 * i)) as u8);
            }
            return out;
        }
    }
    out.push(0xFF);
    out.extend_from_slice(&value.to_le_bytes());
    out
}

/// Wraps pack data and a next header into a complete archive file.
fn build_archive(pack: &[u8], header: &[u8]) -> Vec<u8> {
    let mut start = Vec::new();
    start.extend((pack.len() as u64).to_le_bytes());
    start.extend((header.len() as u64).to_le_bytes());
    start.extend(crc32fast_hash(header).to_le_bytes());

    let mut file = Vec::new();
    file.extend(b"7z\xBC\xAF\x27\x1C");
    file.extend([0u8, 4]);
    file.extend(crc32fast_hash(&start).to_le_bytes());
    file.extend(&start);
    file.extend(pack);
    file.extend(header);
    file
}

fn crc32fast_hash(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// StreamsInfo for a single block with a single COPY coder.
fn copy_streams_info(
    pack_pos: u64,
    pack_size: u64,
    unpack_size: u64,
    block_crc: Option<u32>,
    sub_streams: Option<(&[u64], &[u32])>,
) -> Vec<u8> {
    let mut info = vec![0x06]; // kPackInfo
    info.extend(varint(pack_pos));
    info.extend(varint(1));
    info.push(0x09); // kSize
    info.extend(varint(pack_size));
    info.push(0x00);

    info.push(0x07); // kUnpackInfo
    info.push(0x0B); // kFolder
    info.extend(varint(1));
    info.push(0x00); // not external
    info.extend(varint(1)); // one coder
    info.push(0x01); // id length 1, simple, no attributes
    info.push(0x00); // COPY
    info.push(0x0C); // kCodersUnpackSize
    info.extend(varint(unpack_size));
    if let Some(crc) = block_crc {
        info.push(0x0A); // kCRC
        info.push(0x01); // all defined
        info.extend(crc.to_le_bytes());
    }
    info.push(0x00);

    if let Some((sizes, crcs)) = sub_streams {
        info.push(0x08); // kSubStreamsInfo
        info.push(0x0D); // kNumUnpackStream
        info.extend(varint(sizes.len() as u64));
        info.push(0x09); // kSize, all but the last are stored
        for size in &sizes[..sizes.len() - 1] {
            info.extend(varint(*size));
        }
        info.push(0x0A); // kCRC
        info.push(0x01); // all defined
        for crc in crcs {
            info.extend(crc.to_le_bytes());
        }
        info.push(0x00);
    }
    info.push(0x00); // end of streams info
    info
}

fn files_info(names: &[&str]) -> Vec<u8> {
    let mut info = vec![0x05]; // kFilesInfo
    info.extend(varint(names.len() as u64));
    let mut name_bytes = vec![0u8]; // external flag
    for name in names {
        for unit in name.encode_utf16() {
            name_bytes.extend(unit.to_le_bytes());
        }
        name_bytes.extend([0, 0]);
    }
    info.push(0x11); // kName
    info.extend(varint(name_bytes.len() as u64));
    info.extend(&name_bytes);
    info.push(0x00); // end of properties
    info
}

fn header(streams_info: &[u8], files_info: &[u8]) -> Vec<u8> {
    let mut header = vec![0x01]; // kHeader
    if !streams_info.is_empty() {
        header.push(0x04); // kMainStreamsInfo
        header.extend(streams_info);
    }
    header.extend(files_info);
    header.push(0x00);
    header
}

/// The archive used by several tests: one COPY entry "hello" holding
/// "Hello", with a block checksum.
fn hello_archive(block_crc: u32) -> Vec<u8> {
    let header = header(
        &copy_streams_info(0, 5, 5, Some(block_crc), None),
        &files_info(&["hello"]),
    );
    build_archive(b"Hello", &header)
}

fn solid_archive() -> Vec<u8> {
    let content = b"HelloWorld!!";
    let crcs = [
        crc32fast_hash(b"Hello"),
        crc32fast_hash(b"World"),
        crc32fast_hash(b"!!"),
    ];
    let header = header(
        &copy_streams_info(0, 12, 12, None, Some((&[5, 5, 2], &crcs))),
        &files_info(&["a", "b", "c"]),
    );
    build_archive(content, &header)
}

fn reader_for(data: Vec<u8>) -> ArchiveReader<Cursor<Vec<u8>>> {
    ArchiveReader::new(Cursor::new(data)).unwrap()
}

// ---------------------------------------------------------------------------
// Parsing and sequential access
// ---------------------------------------------------------------------------

#[test]
fn reads_a_single_copy_entry() {
    assert_eq!(crc32fast_hash(b"Hello"), 0xF7D18982);

    let mut reader = reader_for(hello_archive(0xF7D18982));
    assert_eq!(reader.entries().len(), 1);
    let entry = reader.next_entry().unwrap();
    assert_eq!(entry.name(), "hello");
    assert_eq!(entry.size(), 5);
    assert!(entry.has_stream());
    assert!(!entry.is_directory());

    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"Hello");
    assert!(reader.next_entry().is_none());
}

#[test]
fn read_file_by_name() {
    let mut reader = reader_for(hello_archive(0xF7D18982));
    assert_eq!(reader.read_file("hello").unwrap(), b"Hello");
    assert!(matches!(
        reader.read_file("missing"),
        Err(Error::FileNotFound)
    ));
}

#[test]
fn entry_crc_mismatch_surfaces_after_the_content() {
    let mut reader = reader_for(hello_archive(0x00000000));
    let mut entry_reader = reader.entry_reader(0).unwrap();
    let mut buf = [0u8; 5];
    entry_reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"Hello");
    let e = entry_reader.read(&mut buf).unwrap_err();
    assert!(matches!(Error::from(e), Error::EntryCrcMismatch));
}

#[test]
fn reparsing_is_deterministic() {
    let data = hello_archive(0xF7D18982);
    let first = Archive::read(&mut Cursor::new(data.clone())).unwrap();
    let second = Archive::read(&mut Cursor::new(data)).unwrap();
    assert_eq!(format!("{first:?}"), format!("{second:?}"));
}

#[test]
fn compressed_size_reports_the_pack_stream() {
    let reader = reader_for(hello_archive(0xF7D18982));
    assert_eq!(reader.entries()[0].compressed_size, 5);
}

#[test]
fn entry_compression_methods_name_the_pipeline() {
    let reader = reader_for(hello_archive(0xF7D18982));
    let methods = reader.entry_compression_methods("hello").unwrap();
    assert_eq!(methods, vec![sevenz_stream::CoderMethod::COPY]);
}

// ---------------------------------------------------------------------------
// Signature and start header validation
// ---------------------------------------------------------------------------

#[test]
fn rejects_a_bad_signature() {
    let mut data = hello_archive(0xF7D18982);
    data[0] = b'8';
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::BadSignature(_))
    ));
}

#[test]
fn rejects_an_unknown_major_version() {
    let mut data = hello_archive(0xF7D18982);
    data[6] = 1;
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::UnsupportedVersion { major: 1, .. })
    ));
}

#[test]
fn rejects_a_corrupt_start_header() {
    let mut data = hello_archive(0xF7D18982);
    data[12] ^= 0xFF;
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::StartHeaderCrcMismatch)
    ));
}

#[test]
fn rejects_a_next_header_pointing_outside_the_file() {
    let header = header(
        &copy_streams_info(0, 5, 5, None, None),
        &files_info(&["hello"]),
    );
    let mut data = build_archive(b"Hello", &header);
    // enlarge the declared next header size and fix the start header CRC
    data[20..28].copy_from_slice(&(header.len() as u64 + 1000).to_le_bytes());
    let crc = crc32fast_hash(&data[12..32]);
    data[8..12].copy_from_slice(&crc.to_le_bytes());
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::NextHeaderOutOfBounds)
    ));
}

#[test]
fn rejects_a_corrupt_next_header() {
    let mut data = hello_archive(0xF7D18982);
    let last = data.len() - 1;
    data[last] ^= 0xFF;
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::NextHeaderCrcMismatch)
    ));
}

#[test]
fn rejects_pack_data_running_past_the_file() {
    let header = header(
        &copy_streams_info(0, 500, 5, None, None),
        &files_info(&["hello"]),
    );
    let data = build_archive(b"Hello", &header);
    assert!(Archive::read(&mut Cursor::new(data)).is_err());
}

#[test]
fn rejects_sub_stream_sizes_exceeding_the_block() {
    let crcs = [0u32, 0, 0];
    let header = header(
        &copy_streams_info(0, 12, 12, None, Some((&[5, 8, 0], &crcs))),
        &files_info(&["a", "b", "c"]),
    );
    let data = build_archive(b"HelloWorld!!", &header);
    assert!(Archive::read(&mut Cursor::new(data)).is_err());
}

// ---------------------------------------------------------------------------
// Boundary archives
// ---------------------------------------------------------------------------

#[test]
fn parses_an_archive_with_no_entries() {
    let data = build_archive(b"", &[0x01, 0x00]);
    let archive = Archive::read(&mut Cursor::new(data.clone())).unwrap();
    assert!(archive.files.is_empty());
    assert!(archive.blocks.is_empty());

    let mut reader = reader_for(data);
    assert!(reader.next_entry().is_none());
}

#[test]
fn parses_a_single_empty_file_without_blocks() {
    let mut files = vec![0x05]; // kFilesInfo
    files.extend(varint(1));
    files.extend([0x0E, 0x01, 0x80]); // kEmptyStream, one byte, bit set
    files.extend([0x0F, 0x01, 0x80]); // kEmptyFile
    files.extend(files_name_block(&["empty.txt"]));
    files.push(0x00);
    let header = header(&[], &files);
    let data = build_archive(b"", &header);

    let mut reader = reader_for(data);
    let entry = reader.next_entry().unwrap();
    assert_eq!(entry.name(), "empty.txt");
    assert!(!entry.has_stream());
    assert!(!entry.is_directory());
    assert_eq!(entry.size(), 0);
    assert_eq!(reader.read_file("empty.txt").unwrap(), b"");
}

/// Just the kName property block of a files info.
fn files_name_block(names: &[&str]) -> Vec<u8> {
    let mut name_bytes = vec![0u8];
    for name in names {
        for unit in name.encode_utf16() {
            name_bytes.extend(unit.to_le_bytes());
        }
        name_bytes.extend([0, 0]);
    }
    let mut block = vec![0x11];
    block.extend(varint(name_bytes.len() as u64));
    block.extend(&name_bytes);
    block
}

#[test]
fn unnamed_entries_can_borrow_a_default_name() {
    // files info without a kName block
    let mut files = vec![0x05];
    files.extend(varint(1));
    files.push(0x00);
    let header = header(&copy_streams_info(0, 5, 5, None, None), &files);
    let data = build_archive(b"Hello", &header);

    let archive = Archive::read(&mut Cursor::new(data.clone())).unwrap();
    assert_eq!(archive.files[0].name(), "");

    let options = ReaderOptions::default()
        .with_default_name("payload")
        .with_use_default_name_for_unnamed_entries(true);
    let archive = Archive::read_with_options(&mut Cursor::new(data), &options).unwrap();
    assert_eq!(archive.files[0].name(), "payload");
}

// ---------------------------------------------------------------------------
// Header format errors
// ---------------------------------------------------------------------------

#[test]
fn rejects_k_start_pos() {
    let mut files = vec![0x05];
    files.extend(varint(1));
    files.extend([0x18, 0x01, 0x00]); // kStartPos
    files.push(0x00);
    let header = header(&copy_streams_info(0, 5, 5, None, None), &files);
    let data = build_archive(b"Hello", &header);
    assert!(Archive::read(&mut Cursor::new(data)).is_err());
}

#[test]
fn rejects_external_names() {
    let mut files = vec![0x05];
    files.extend(varint(1));
    files.extend([0x11, 0x03, 0x01, 0x00, 0x00]); // kName with external = 1
    files.push(0x00);
    let header = header(&copy_streams_info(0, 5, 5, None, None), &files);
    let data = build_archive(b"Hello", &header);
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::ExternalUnsupported)
    ));
}

#[test]
fn rejects_empty_file_bits_before_empty_stream() {
    let mut files = vec![0x05];
    files.extend(varint(1));
    files.extend([0x0F, 0x01, 0x80]); // kEmptyFile without kEmptyStream
    files.push(0x00);
    let header = header(&copy_streams_info(0, 5, 5, None, None), &files);
    let data = build_archive(b"Hello", &header);
    assert!(Archive::read(&mut Cursor::new(data)).is_err());
}

#[test]
fn unknown_coders_are_rejected_when_read() {
    let mut info = vec![0x06];
    info.extend(varint(0));
    info.extend(varint(1));
    info.extend([0x09, 0x05, 0x00]); // one pack stream of five bytes
    info.push(0x07);
    info.extend([0x0B, 0x01, 0x00]); // one folder
    info.extend(varint(1));
    info.extend([0x01, 0x7F]); // unknown single byte method id
    info.extend([0x0C, 0x05, 0x00, 0x00]);
    let header = header(&info, &files_info(&["x"]));
    let data = build_archive(b"Hello", &header);

    let mut reader = reader_for(data);
    assert!(matches!(
        reader.read_file("x"),
        Err(Error::UnsupportedCompressionMethod(_))
    ));
}

#[test]
fn encrypted_entries_require_a_password() {
    let mut info = vec![0x06];
    info.extend(varint(0));
    info.extend(varint(1));
    info.extend([0x09, 0x10, 0x00]);
    info.push(0x07);
    info.extend([0x0B, 0x01, 0x00]);
    info.extend(varint(1));
    info.extend([0x04, 0x06, 0xF1, 0x07, 0x01]); // AES256SHA256
    info.extend([0x0C, 0x10, 0x00, 0x00]);
    let header = header(&info, &files_info(&["secret"]));
    let data = build_archive(&[0u8; 16], &header);

    let mut reader = reader_for(data.clone());
    assert!(matches!(
        reader.read_file("secret"),
        Err(Error::PasswordRequired)
    ));

    let options = ReaderOptions::default().with_password(Password::new("letmein"));
    let mut reader =
        ArchiveReader::new_with_options(Cursor::new(data), options).unwrap();
    assert!(matches!(
        reader.read_file("secret"),
        Err(Error::Unsupported(_))
    ));
}

// ---------------------------------------------------------------------------
// Encoded headers
// ---------------------------------------------------------------------------

#[test]
fn compressed_headers_parse_like_inline_ones() {
    let inline_header = header(
        &copy_streams_info(0, 5, 5, Some(0xF7D18982), None),
        &files_info(&["hello"]),
    );

    // store the header itself as a COPY block behind the pack data
    let mut pack = b"Hello".to_vec();
    pack.extend(&inline_header);
    let mut encoded = vec![0x17]; // kEncodedHeader
    encoded.extend(copy_streams_info(
        5,
        inline_header.len() as u64,
        inline_header.len() as u64,
        Some(crc32fast_hash(&inline_header)),
        None,
    ));
    let data = build_archive(&pack, &encoded);

    let mut reader = reader_for(data);
    assert_eq!(reader.entries().len(), 1);
    assert_eq!(reader.entries()[0].name(), "hello");
    assert_eq!(reader.read_file("hello").unwrap(), b"Hello");
}

// ---------------------------------------------------------------------------
// Solid blocks
// ---------------------------------------------------------------------------

#[test]
fn solid_blocks_stream_sequentially() {
    let mut reader = reader_for(solid_archive());
    assert!(reader.archive().is_solid);

    let mut seen = Vec::new();
    while let Some(entry) = reader.next_entry() {
        let name = entry.name().to_string();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        seen.push((name, content));
    }
    assert_eq!(
        seen,
        vec![
            ("a".into(), b"Hello".to_vec()),
            ("b".into(), b"World".to_vec()),
            ("c".into(), b"!!".to_vec()),
        ]
    );
}

#[test]
fn solid_blocks_allow_random_access_by_skipping() {
    let mut reader = reader_for(solid_archive());

    let mut content = Vec::new();
    reader.entry_reader(2).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"!!");

    // going backwards reopens the block
    content.clear();
    reader.entry_reader(0).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"Hello");

    content.clear();
    reader.entry_reader(1).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"World");
}

#[test]
fn partially_read_entries_are_reopened_on_random_access() {
    let mut reader = reader_for(solid_archive());

    let mut prefix = [0u8; 2];
    reader.entry_reader(0).unwrap().read_exact(&mut prefix).unwrap();
    assert_eq!(&prefix, b"He");

    let mut content = Vec::new();
    reader.entry_reader(1).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"World");

    // and the abandoned entry is still fully readable afterwards
    content.clear();
    reader.entry_reader(0).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"Hello");
}

#[test]
fn read_file_inside_a_solid_block() {
    let mut reader = reader_for(solid_archive());
    assert_eq!(reader.read_file("b").unwrap(), b"World");
}

#[test]
fn for_each_entries_visits_every_entry_once() {
    let mut reader = reader_for(solid_archive());
    let mut seen = Vec::new();
    reader
        .for_each_entries(|entry, content_reader| {
            let mut content = Vec::new();
            content_reader.read_to_end(&mut content)?;
            seen.push((entry.name().to_string(), content));
            Ok(true)
        })
        .unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1], ("b".to_string(), b"World".to_vec()));
}

#[test]
fn corrupt_solid_entry_is_detected_while_skipping() {
    let mut data = solid_archive();
    // flip a content byte of entry "a" inside the pack data
    data[32] ^= 0xFF;
    let mut reader = reader_for(data);
    // random access to "c" has to stream over the corrupt "a"
    let e = reader.read_file("c").unwrap_err();
    assert!(matches!(e, Error::EntryCrcMismatch));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn zeroed_start_headers_are_reported_recoverable() {
    let mut data = hello_archive(0xF7D18982);
    data[8..32].fill(0);
    assert!(matches!(
        Archive::read(&mut Cursor::new(data)),
        Err(Error::RecoverableStartHeader)
    ));
}

#[test]
fn recovery_locates_the_end_header() {
    let mut data = hello_archive(0xF7D18982);
    data[8..32].fill(0);
    let options = ReaderOptions::default().with_recover_broken_archives(true);
    let archive = Archive::read_with_options(&mut Cursor::new(data.clone()), &options).unwrap();
    assert_eq!(archive.files.len(), 1);
    assert_eq!(archive.files[0].name(), "hello");

    let mut reader =
        ArchiveReader::new_with_options(Cursor::new(data), options).unwrap();
    assert_eq!(reader.read_file("hello").unwrap(), b"Hello");
}

#[test]
fn recovery_gives_up_without_a_plausible_header() {
    // all pack data, no header bytes at all
    let mut data = build_archive(&[0x55u8; 64], &[0x01, 0x00]);
    let len = data.len();
    data.truncate(len - 2); // drop the real header
    data[8..32].fill(0);
    let options = ReaderOptions::default().with_recover_broken_archives(true);
    assert!(Archive::read_with_options(&mut Cursor::new(data), &options).is_err());
}

// ---------------------------------------------------------------------------
// Memory limits
// ---------------------------------------------------------------------------

/// Header declaring many blocks, coders and entries while staying tiny on
/// the wire.
fn huge_header(blocks: usize, coders_per_block: usize, files: usize) -> Vec<u8> {
    let mut info = vec![0x06]; // kPackInfo
    info.extend(varint(0));
    info.extend(varint(blocks as u64));
    info.push(0x09);
    for _ in 0..blocks {
        info.extend(varint(1));
    }
    info.push(0x00);

    info.push(0x07); // kUnpackInfo
    info.push(0x0B);
    info.extend(varint(blocks as u64));
    info.push(0x00);
    for _ in 0..blocks {
        info.extend(varint(coders_per_block as u64));
        for _ in 0..coders_per_block {
            info.extend([0x01, 0x00]); // COPY
        }
        // chain the coders with bind pairs
        for pair in 0..coders_per_block - 1 {
            info.extend(varint(pair as u64 + 1));
            info.extend(varint(pair as u64));
        }
    }
    info.push(0x0C);
    for _ in 0..blocks * coders_per_block {
        info.extend(varint(1));
    }
    info.push(0x00);
    info.push(0x00);

    let mut files_block = vec![0x05];
    files_block.extend(varint(files as u64));
    files_block.push(0x0E); // kEmptyStream, every entry empty
    files_block.extend(varint(files.div_ceil(8) as u64));
    files_block.extend(vec![0xFF; files.div_ceil(8)]);
    files_block.push(0x00);

    let mut header = vec![0x01, 0x04];
    header.extend(info);
    header.extend(files_block);
    header.push(0x00);
    header
}

#[test]
fn oversized_declarations_hit_the_memory_limit() {
    let data = build_archive(&[0u8; 100], &huge_header(100, 100, 1_000_000));

    let tight = ReaderOptions::default().with_max_memory_limit_kib(1024);
    let e = Archive::read_with_options(&mut Cursor::new(data.clone()), &tight).unwrap_err();
    let Error::MaxMemLimited { required_kib, .. } = e else {
        panic!("expected MaxMemLimited, got {e:?}");
    };
    assert!(required_kib > 1024);

    let generous = ReaderOptions::default().with_max_memory_limit_kib(1024 * 1024);
    let archive = Archive::read_with_options(&mut Cursor::new(data), &generous).unwrap();
    assert_eq!(archive.files.len(), 1_000_000);
    assert_eq!(archive.blocks.len(), 100);
}

#[test]
fn the_memory_limit_boundary_is_exact() {
    let data = build_archive(&[0u8; 100], &huge_header(100, 100, 1_000_000));

    let probe = ReaderOptions::default().with_max_memory_limit_kib(0);
    let e = Archive::read_with_options(&mut Cursor::new(data.clone()), &probe).unwrap_err();
    let Error::MaxMemLimited { required_kib, .. } = e else {
        panic!("expected MaxMemLimited, got {e:?}");
    };

    let exact = ReaderOptions::default().with_max_memory_limit_kib(required_kib);
    assert!(Archive::read_with_options(&mut Cursor::new(data.clone()), &exact).is_ok());

    let one_less = ReaderOptions::default().with_max_memory_limit_kib(required_kib - 1);
    assert!(matches!(
        Archive::read_with_options(&mut Cursor::new(data), &one_less),
        Err(Error::MaxMemLimited { .. })
    ));
}
