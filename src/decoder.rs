use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
#[cfg(feature = "bzip2")]
use bzip2::read::BzDecoder;
#[cfg(feature = "deflate")]
use flate2::bufread::DeflateDecoder;
use lzma_rust2::{Lzma2Reader, LzmaReader};

use crate::{ReaderOptions, archive::CoderMethod, block::Coder, error::Error};

#[allow(clippy::large_enum_variant)]
pub(crate) enum Decoder<R: Read> {
    Copy(R),
    Lzma(Box<LzmaReader<R>>),
    Lzma2(Box<Lzma2Reader<R>>),
    #[cfg(feature = "bzip2")]
    BZip2(BzDecoder<R>),
    #[cfg(feature = "deflate")]
    Deflate(DeflateDecoder<io::BufReader<R>>),
    #[cfg(feature = "lz4")]
    Lz4(Box<lz4_flex::frame::FrameDecoder<R>>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::Decoder<'static, io::BufReader<R>>),
    #[cfg(feature = "brotli")]
    Brotli(Box<brotli::Decompressor<R>>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Copy(r) => r.read(buf),
            Decoder::Lzma(r) => r.read(buf),
            Decoder::Lzma2(r) => r.read(buf),
            #[cfg(feature = "bzip2")]
            Decoder::BZip2(r) => r.read(buf),
            #[cfg(feature = "deflate")]
            Decoder::Deflate(r) => r.read(buf),
            #[cfg(feature = "lz4")]
            Decoder::Lz4(r) => r.read(buf),
            #[cfg(feature = "zstd")]
            Decoder::Zstd(r) => r.read(buf),
            #[cfg(feature = "brotli")]
            Decoder::Brotli(r) => r.read(buf),
        }
    }
}

/// Wraps `input` in the decoder for `coder`'s method.
///
/// `uncompressed_len` is the declared output size of this pipeline stage,
/// needed by coders whose stream carries no own end marker.
pub(crate) fn add_decoder<I: Read>(
    input: I,
    uncompressed_len: u64,
    coder: &Coder,
    options: &ReaderOptions,
) -> Result<Decoder<I>, Error> {
    let Some(method) = CoderMethod::by_id(coder.method_id()) else {
        return Err(Error::UnsupportedCompressionMethod(format!(
            "{:?}",
            coder.method_id()
        )));
    };
    match method.id() {
        CoderMethod::ID_COPY => Ok(Decoder::Copy(input)),
        CoderMethod::ID_LZMA => {
            if coder.properties.len() < 5 {
                return Err(Error::other("LZMA properties too short"));
            }
            let props = coder.properties[0];
            let mut dict_bytes = &coder.properties[1..5];
            let dict_size = dict_bytes.read_u32::<LittleEndian>().map_err(Error::io)?;
            assert_dictionary_fits(dict_size, options.max_memory_limit_kib)?;
            let reader =
                LzmaReader::new_with_props(input, uncompressed_len, props, dict_size, None)
                    .map_err(Error::io)?;
            Ok(Decoder::Lzma(Box::new(reader)))
        }
        CoderMethod::ID_LZMA2 => {
            let dict_size = lzma2_dict_size(coder)?;
            assert_dictionary_fits(dict_size, options.max_memory_limit_kib)?;
            Ok(Decoder::Lzma2(Box::new(Lzma2Reader::new(
                input, dict_size, None,
            ))))
        }
        #[cfg(feature = "bzip2")]
        CoderMethod::ID_BZIP2 => Ok(Decoder::BZip2(BzDecoder::new(input))),
        #[cfg(feature = "deflate")]
        CoderMethod::ID_DEFLATE => Ok(Decoder::Deflate(DeflateDecoder::new(io::BufReader::new(
            input,
        )))),
        #[cfg(feature = "lz4")]
        CoderMethod::ID_LZ4 => Ok(Decoder::Lz4(Box::new(lz4_flex::frame::FrameDecoder::new(
            input,
        )))),
        #[cfg(feature = "zstd")]
        CoderMethod::ID_ZSTD => Ok(Decoder::Zstd(zstd::Decoder::new(input).map_err(Error::io)?)),
        #[cfg(feature = "brotli")]
        CoderMethod::ID_BROTLI => Ok(Decoder::Brotli(Box::new(brotli::Decompressor::new(
            input, 4096,
        )))),
        CoderMethod::ID_AES256_SHA256 => {
            // The slot is recognised so that the pipeline parses, but
            // decryption itself is not implemented.
            if options.password.is_empty() {
                Err(Error::PasswordRequired)
            } else {
                Err(Error::unsupported(
                    "AES-256 decryption is not supported by this crate",
                ))
            }
        }
        _ => Err(Error::UnsupportedCompressionMethod(
            method.name().to_string(),
        )),
    }
}

/// The combined dictionary-or-so memory footprint check applied before a
/// decoder allocates its window.
fn assert_dictionary_fits(dict_size: u32, max_memory_limit_kib: usize) -> Result<(), Error> {
    let required_kib = (dict_size as usize).div_ceil(1024) + 16;
    if required_kib > max_memory_limit_kib {
        return Err(Error::MaxMemLimited {
            max_kib: max_memory_limit_kib,
            required_kib,
        });
    }
    Ok(())
}

fn lzma2_dict_size(coder: &Coder) -> Result<u32, Error> {
    let Some(&dict_size_bits) = coder.properties.first() else {
        return Err(Error::other("LZMA2 properties too short"));
    };
    let dict_size_bits = dict_size_bits as u32;
    if (dict_size_bits & !0x3F) != 0 {
        return Err(Error::other("Unsupported LZMA2 property bits"));
    }
    if dict_size_bits > 40 {
        return Err(Error::other("Dictionary larger than 4GiB maximum size"));
    }
    if dict_size_bits == 40 {
        return Ok(0xFFFF_FFFF);
    }
    Ok((2 | (dict_size_bits & 0x1)) << (dict_size_bits / 2 + 11))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lzma2_dict_size_decoding() {
        let coder_with = |bits: u8| Coder {
            properties: vec![bits],
            ..Default::default()
        };
        assert_eq!(lzma2_dict_size(&coder_with(0)).unwrap(), 1 << 12);
        assert_eq!(lzma2_dict_size(&coder_with(1)).unwrap(), 3 << 11);
        assert_eq!(lzma2_dict_size(&coder_with(2)).unwrap(), 1 << 13);
        assert_eq!(lzma2_dict_size(&coder_with(40)).unwrap(), 0xFFFF_FFFF);
        assert!(lzma2_dict_size(&coder_with(41)).is_err());
        assert!(lzma2_dict_size(&coder_with(0x80)).is_err());
    }

    #[test]
    fn dictionary_memory_limit_is_enforced() {
        assert!(assert_dictionary_fits(1 << 20, 64).is_err());
        assert!(assert_dictionary_fits(1 << 20, 2048).is_ok());
    }
}
