//! LZ4 block format encoder.
//!
//! [`Lz4BlockEncoder`] serialises the output of the LZ77 matcher into raw
//! LZ4 blocks (not the frame format): a sequence of pairs, each a literal
//! run followed by a back-reference. The format constrains the end of a
//! block: the last pair is literal-only, at least five literal bytes close
//! the block and no match may start within the last twelve bytes. Since the
//! matcher knows nothing about these rules the encoder holds back the tail
//! pairs and rewrites them once the end of the stream is known, expanding
//! back-references into literals from a retained window where necessary.

use std::{
    collections::VecDeque,
    io::{self, Write},
};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    error::Error,
    lz77::{Lz77Block, Lz77Compressor, Lz77Options, Lz77OptionsBuilder},
};

/// Window size of the LZ4 block format.
const WINDOW_SIZE: usize = 1 << 16;
/// Shortest back-reference the format can express.
const MIN_BACK_REFERENCE_LENGTH: usize = 4;
/// No match may begin closer than this to the end of the block.
const MIN_OFFSET_OF_LAST_BACK_REFERENCE: usize = 12;

/// A literal run plus an optional trailing back-reference, the unit of the
/// LZ4 block format.
#[derive(Debug, Default)]
struct Pair {
    literals: Vec<u8>,
    br_offset: usize,
    br_length: usize,
    written: bool,
}

impl Pair {
    fn has_back_reference(&self) -> bool {
        self.br_length > 0
    }

    fn length(&self) -> usize {
        self.literals.len() + self.br_length
    }

    /// A pair may be flushed early only when enough output follows it to
    /// still satisfy the end of block rules.
    fn can_be_written(&self, length_of_blocks_after: usize) -> bool {
        self.has_back_reference()
            && length_of_blocks_after
                >= MIN_OFFSET_OF_LAST_BACK_REFERENCE + MIN_BACK_REFERENCE_LENGTH
    }

    fn write_to<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let lit_len = self.literals.len();
        let br_code = self
            .br_length
            .saturating_sub(MIN_BACK_REFERENCE_LENGTH);
        let token = ((lit_len.min(15) << 4) | br_code.min(15)) as u8;
        out.write_all(&[token])?;
        if lit_len >= 15 {
            write_extended_length(out, lit_len - 15)?;
        }
        out.write_all(&self.literals)?;
        if self.has_back_reference() {
            out.write_u16::<LittleEndian>(self.br_offset as u16)?;
            if br_code >= 15 {
                write_extended_length(out, br_code - 15)?;
            }
        }
        self.written = true;
        Ok(())
    }
}

/// Writes a length continuation: 0xFF bytes plus a final byte below 255,
/// summed up by the decoder.
fn write_extended_length<W: Write>(out: &mut W, mut len: usize) -> io::Result<()> {
    while len >= 255 {
        out.write_all(&[0xFF])?;
        len -= 255;
    }
    out.write_all(&[len as u8])
}

/// Compresses data into a single raw LZ4 block.
///
/// Data is fed through the [`Write`] impl; [`finish`](Self::finish) performs
/// the end of block rewrite and must be called to obtain a complete block.
///
/// ```rust
/// use std::io::Write;
///
/// use sevenz_stream::lz4::Lz4BlockEncoder;
///
/// let mut encoder = Lz4BlockEncoder::new(Vec::new()).unwrap();
/// encoder.write_all(b"blah blah blah blah blah!").unwrap();
/// let block = encoder.finish().unwrap();
/// ```
pub struct Lz4BlockEncoder<W: Write> {
    compressor: Lz77Compressor,
    state: EncoderState<W>,
    finished: bool,
}

struct EncoderState<W: Write> {
    out: W,
    pairs: VecDeque<Pair>,
    /// Recently output data, most recent run first, kept long enough to
    /// cover one window for the tail rewrite.
    expanded_blocks: VecDeque<Vec<u8>>,
}

impl<W: Write> Lz4BlockEncoder<W> {
    /// Creates an encoder with the default matcher options.
    pub fn new(out: W) -> Result<Self, Error> {
        Ok(Self::with_options(out, Self::default_options().build()?))
    }

    /// Creates an encoder with custom matcher options, obtained from
    /// [`default_options`](Self::default_options).
    pub fn with_options(out: W, options: Lz77Options) -> Self {
        Self {
            compressor: Lz77Compressor::new(options),
            state: EncoderState {
                out,
                pairs: VecDeque::new(),
                expanded_blocks: VecDeque::new(),
            },
            finished: false,
        }
    }

    /// The matcher options matching the LZ4 block format; tune the search
    /// related knobs from here.
    pub fn default_options() -> Lz77OptionsBuilder {
        Lz77Options::builder(WINDOW_SIZE)
            .with_min_back_ref_len(MIN_BACK_REFERENCE_LENGTH)
            .with_max_back_ref_len(WINDOW_SIZE - 1)
            .with_max_offset(WINDOW_SIZE - 1)
            .with_max_literal_len(WINDOW_SIZE - 1)
    }

    /// Seeds the match window with a dictionary. Must precede the first
    /// write.
    pub fn prefill(&mut self, dict: &[u8]) -> Result<(), Error> {
        self.compressor.prefill(dict)?;
        let len = dict.len().min(WINDOW_SIZE);
        self.state
            .expanded_blocks
            .push_front(dict[dict.len() - len..].to_vec());
        Ok(())
    }

    /// Rewrites the tail to satisfy the block format, writes all pending
    /// pairs and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.finished {
            self.finished = true;
            let state = &mut self.state;
            self.compressor
                .finish(&mut |block| state.consume(block))
                .map_err(io::Error::from)?;
        }
        Ok(self.state.out)
    }
}

impl<W: Write> Write for Lz4BlockEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let state = &mut self.state;
        self.compressor
            .compress(buf, &mut |block| state.consume(block))
            .map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.out.flush()
    }
}

impl<W: Write> EncoderState<W> {
    fn consume(&mut self, block: Lz77Block<'_>) -> io::Result<()> {
        match block {
            Lz77Block::Literal(data) => {
                self.write_writable_pairs(data.len())?;
                let pair = self.unfinished_pair();
                pair.literals.extend_from_slice(data);
                self.record(data.to_vec());
                self.prune();
                Ok(())
            }
            Lz77Block::BackReference { offset, length } => {
                self.write_writable_pairs(length)?;
                let expanded = self.expand(offset, length)?;
                let pair = self.unfinished_pair();
                pair.br_offset = offset;
                pair.br_length = length;
                self.record(expanded);
                self.prune();
                Ok(())
            }
            Lz77Block::EndOfData => {
                self.rewrite_last_pairs()?;
                for pair in self.pairs.iter_mut() {
                    if !pair.written {
                        pair.write_to(&mut self.out)?;
                    }
                }
                self.pairs.clear();
                Ok(())
            }
        }
    }

    /// The trailing pair still accepting literals, created on demand.
    fn unfinished_pair(&mut self) -> &mut Pair {
        if self.pairs.back().is_none_or(Pair::has_back_reference) {
            self.pairs.push_back(Pair::default());
        }
        let last = self.pairs.len() - 1;
        &mut self.pairs[last]
    }

    /// Flushes every pair that is safely complete given `incoming_len` more
    /// bytes are about to be appended.
    fn write_writable_pairs(&mut self, incoming_len: usize) -> io::Result<()> {
        let mut unwritten_length = incoming_len;
        for pair in self.pairs.iter().rev() {
            if pair.written {
                break;
            }
            unwritten_length += pair.length();
        }
        for i in 0..self.pairs.len() {
            if self.pairs[i].written {
                continue;
            }
            unwritten_length -= self.pairs[i].length();
            if !self.pairs[i].can_be_written(unwritten_length) {
                break;
            }
            self.pairs[i].write_to(&mut self.out)?;
        }
        Ok(())
    }

    fn record(&mut self, bytes: Vec<u8>) {
        self.expanded_blocks.push_front(bytes);
    }

    /// Materialises a back-reference against the retained output history.
    fn expand(&self, offset: usize, length: usize) -> io::Result<Vec<u8>> {
        // offset 1 repeats the previous byte, a surprisingly common case
        if offset == 1 {
            let last = self
                .expanded_blocks
                .front()
                .and_then(|block| block.last().copied())
                .ok_or_else(|| io::Error::other("back-reference into empty history"))?;
            return Ok(vec![last; length]);
        }
        let mut expanded = Vec::with_capacity(length);
        while expanded.len() < length {
            let remaining = length - expanded.len();
            if offset > expanded.len() {
                // still reading from the recorded history
                let back = offset - expanded.len();
                let mut covered = 0;
                let mut source = None;
                for block in &self.expanded_blocks {
                    covered += block.len();
                    if covered >= back {
                        source = Some((block, covered));
                        break;
                    }
                }
                let Some((block, covered)) = source else {
                    return Err(io::Error::other(
                        "back-reference outside the retained window",
                    ));
                };
                let start = covered - back;
                let n = remaining.min(block.len() - start);
                expanded.extend_from_slice(&block[start..start + n]);
            } else {
                // the reference has caught up with the bytes just produced
                let start = expanded.len() - offset;
                let n = remaining.min(offset);
                expanded.extend_from_within(start..start + n);
            }
        }
        Ok(expanded)
    }

    /// Drops history blocks beyond one window and written pairs no longer
    /// needed for the tail rewrite.
    fn prune(&mut self) {
        let mut retained = 0;
        let mut blocks_to_keep = 0;
        for block in &self.expanded_blocks {
            blocks_to_keep += 1;
            retained += block.len();
            if retained >= WINDOW_SIZE {
                break;
            }
        }
        self.expanded_blocks.truncate(blocks_to_keep);

        let mut pair_lengths = 0;
        let mut pairs_to_keep = 0;
        for pair in self.pairs.iter().rev() {
            pairs_to_keep += 1;
            pair_lengths += pair.length();
            if pair_lengths >= WINDOW_SIZE {
                break;
            }
        }
        while self.pairs.len() > pairs_to_keep {
            match self.pairs.front() {
                Some(pair) if pair.written => {
                    self.pairs.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Rewrites the unwritten tail so the block ends in at least
    /// [`MIN_OFFSET_OF_LAST_BACK_REFERENCE`] literal bytes after the last
    /// back-reference.
    ///
    /// All but the first of the collected tail pairs are merged into one
    /// literal-only pair by expanding their back-references. The first one
    /// may keep a shortened back-reference when it is long enough to donate
    /// the missing literal bytes and still express a minimal match;
    /// otherwise it is expanded entirely.
    fn rewrite_last_pairs(&mut self) -> io::Result<()> {
        let mut tail_len = 0;
        let mut tail_count = 0;
        for pair in self.pairs.iter().rev() {
            if pair.written {
                break;
            }
            tail_count += 1;
            tail_len += pair.length();
            if tail_len >= MIN_OFFSET_OF_LAST_BACK_REFERENCE {
                break;
            }
        }

        let tail_start = self.pairs.len() - tail_count;
        let mut tail = self.pairs.split_off(tail_start);
        let mut replacement = Pair::default();
        if let Some(mut first) = tail.pop_front() {
            let rest_len: usize = tail.iter().map(Pair::length).sum();
            let still_needed = MIN_OFFSET_OF_LAST_BACK_REFERENCE.saturating_sub(rest_len);
            if first.has_back_reference()
                && first.br_length >= MIN_BACK_REFERENCE_LENGTH + still_needed
            {
                let donated = self.expand(rest_len + still_needed, still_needed)?;
                replacement.literals.extend_from_slice(&donated);
                first.br_length -= still_needed;
                self.pairs.push_back(first);
            } else {
                let mut literals = std::mem::take(&mut first.literals);
                if first.has_back_reference() {
                    let expanded = self.expand(rest_len + first.br_length, first.br_length)?;
                    literals.extend_from_slice(&expanded);
                }
                replacement.literals = literals;
            }
            if rest_len > 0 {
                let rest = self.expand(rest_len, rest_len)?;
                replacement.literals.extend_from_slice(&rest);
            }
        }
        self.pairs.push_back(replacement);
        Ok(())
    }
}
