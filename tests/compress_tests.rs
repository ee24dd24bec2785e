use std::io::Write;

use sevenz_stream::{
    lz4::Lz4BlockEncoder,
    lz77::{Lz77Block, Lz77Compressor, Lz77Options},
};

#[test]
fn lz77_emits_literals_and_back_references() {
    let options = Lz77Options::builder(16)
        .with_min_back_ref_len(3)
        .with_max_offset(15)
        .build()
        .unwrap();
    let mut compressor = Lz77Compressor::new(options);

    let mut trace = Vec::new();
    let mut sink = |block: Lz77Block<'_>| {
        trace.push(match block {
            Lz77Block::Literal(data) => format!("lit:{}", String::from_utf8_lossy(data)),
            Lz77Block::BackReference { offset, length } => format!("ref:{offset},{length}"),
            Lz77Block::EndOfData => "eod".to_string(),
        });
        Ok(())
    };
    compressor.compress(b"abcdeabcdeabcde", &mut sink).unwrap();
    compressor.finish(&mut sink).unwrap();

    assert_eq!(trace, vec!["lit:abcde", "ref:5,10", "eod"]);
}

#[test]
fn lz4_blocks_decode_with_a_reference_decoder() {
    let mut data = Vec::new();
    for i in 0u32..5000 {
        data.extend_from_slice(format!("entry {} of the log\n", i % 100).as_bytes());
    }

    let mut encoder = Lz4BlockEncoder::new(Vec::new()).unwrap();
    encoder.write_all(&data).unwrap();
    let block = encoder.finish().unwrap();

    assert!(block.len() < data.len() / 2, "repetitive input should shrink");
    let decoded = lz4_flex::block::decompress(&block, data.len()).unwrap();
    assert_eq!(decoded, data);
}

#[test]
fn lz4_copes_with_incompressible_input() {
    // a pseudo random sequence the matcher can do nothing with
    let mut state = 0x2545F491u32;
    let data: Vec<u8> = (0..10_000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();

    let mut encoder = Lz4BlockEncoder::new(Vec::new()).unwrap();
    encoder.write_all(&data).unwrap();
    let block = encoder.finish().unwrap();

    let decoded = lz4_flex::block::decompress(&block, data.len()).unwrap();
    assert_eq!(decoded, data);
}

#[test]
fn lz4_honours_a_prefilled_dictionary() {
    let dict = b"a rather specific dictionary phrase";
    let mut payload = Vec::new();
    payload.extend_from_slice(b"a rather specific dictionary phrase, reused");
    payload.extend_from_slice(b" and some trailing content to round the block off");

    let mut encoder = Lz4BlockEncoder::new(Vec::new()).unwrap();
    encoder.prefill(dict).unwrap();
    encoder.write_all(&payload).unwrap();
    let block = encoder.finish().unwrap();

    let mut plain = Lz4BlockEncoder::new(Vec::new()).unwrap();
    plain.write_all(&payload).unwrap();
    let plain_block = plain.finish().unwrap();

    assert!(
        block.len() < plain_block.len(),
        "the dictionary should shave off the shared prefix"
    );
}

#[test]
fn lz4_chunked_writes_round_trip() {
    let mut data = Vec::new();
    for i in 0u32..3000 {
        data.push((i % 251) as u8);
        data.push(b' ');
    }

    let mut chunked = Lz4BlockEncoder::new(Vec::new()).unwrap();
    for chunk in data.chunks(7) {
        chunked.write_all(chunk).unwrap();
    }
    let block = chunked.finish().unwrap();

    assert_eq!(
        lz4_flex::block::decompress(&block, data.len()).unwrap(),
        data
    );
}
