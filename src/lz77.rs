//! Sliding window LZ77 string matcher with hash chains.
//!
//! [`Lz77Compressor`] turns a byte stream into literal runs and
//! back-references against a window of previously seen data, delivered to a
//! caller supplied sink. It performs no entropy coding and writes no bytes
//! itself; format encoders such as [`crate::lz4::Lz4BlockEncoder`] sit on
//! top of it and serialise the emitted blocks.
//!
//! The matcher keeps a 15 bit rolling hash over three consecutive bytes.
//! `head` maps a hash to the most recent window position with that hash,
//! `prev` chains all older positions sharing it. A search walks the chain up
//! to [`max_candidates`](Lz77OptionsBuilder::with_max_candidates) links,
//! stopping early once a match of
//! [`nice_back_ref_len`](Lz77OptionsBuilder::with_nice_back_ref_len) is
//! found.

use crate::error::Error;

const HASH_BYTES: i32 = 3;
const HASH_SHIFT: i32 = 5;
const HASH_SIZE: usize = 1 << 15;
const HASH_MASK: i32 = (HASH_SIZE - 1) as i32;
const NO_MATCH: i32 = -1;

/// Largest accepted window size; keeps every window index comfortably inside
/// `i32`, the type of the hash tables.
const MAX_WINDOW_SIZE: usize = 1 << 29;

#[inline]
fn next_hash(hash: i32, next_byte: u8) -> i32 {
    ((hash << HASH_SHIFT) ^ next_byte as i32) & HASH_MASK
}

/// Validated parameters of the [`Lz77Compressor`].
#[derive(Debug, Clone)]
pub struct Lz77Options {
    window_size: usize,
    min_back_ref_len: usize,
    max_back_ref_len: usize,
    max_offset: usize,
    max_literal_len: usize,
    nice_back_ref_len: usize,
    max_candidates: usize,
    lazy_matching: bool,
    lazy_threshold: usize,
}

impl Lz77Options {
    /// Starts building options for a window of `window_size` bytes, which
    /// must be a power of two.
    pub fn builder(window_size: usize) -> Lz77OptionsBuilder {
        Lz77OptionsBuilder {
            window_size,
            min_back_ref_len: 3,
            max_back_ref_len: window_size.saturating_sub(1),
            max_offset: window_size.saturating_sub(1),
            max_literal_len: window_size,
            nice_back_ref_len: None,
            max_candidates: None,
            lazy_matching: None,
            lazy_threshold: None,
        }
    }

    /// The size of the sliding window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// The shortest back-reference the matcher will emit.
    pub fn min_back_ref_len(&self) -> usize {
        self.min_back_ref_len
    }

    /// The longest back-reference the matcher will emit.
    pub fn max_back_ref_len(&self) -> usize {
        self.max_back_ref_len
    }

    /// The largest distance a back-reference may span.
    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    /// The longest literal run emitted as a single block.
    pub fn max_literal_len(&self) -> usize {
        self.max_literal_len
    }
}

/// Builder for [`Lz77Options`].
///
/// Out of range values are clamped against the window size; contradictory
/// combinations fail at [`build`](Self::build) with
/// [`Error::InvalidLz77Parameters`].
#[derive(Debug, Clone)]
pub struct Lz77OptionsBuilder {
    window_size: usize,
    min_back_ref_len: usize,
    max_back_ref_len: usize,
    max_offset: usize,
    max_literal_len: usize,
    nice_back_ref_len: Option<usize>,
    max_candidates: Option<usize>,
    lazy_matching: Option<bool>,
    lazy_threshold: Option<usize>,
}

impl Lz77OptionsBuilder {
    /// Sets the minimum back-reference length, never less than three bytes,
    /// the width of the hash.
    pub fn with_min_back_ref_len(mut self, len: usize) -> Self {
        self.min_back_ref_len = len.max(3);
        self
    }

    /// Sets the maximum back-reference length.
    pub fn with_max_back_ref_len(mut self, len: usize) -> Self {
        self.max_back_ref_len = len
            .max(self.min_back_ref_len)
            .min(self.window_size.saturating_sub(1));
        self
    }

    /// Sets the maximum back-reference distance.
    pub fn with_max_offset(mut self, offset: usize) -> Self {
        self.max_offset = if offset == 0 {
            self.window_size.saturating_sub(1)
        } else {
            offset.min(self.window_size.saturating_sub(1))
        };
        self
    }

    /// Sets the maximum length of a single literal block.
    pub fn with_max_literal_len(mut self, len: usize) -> Self {
        self.max_literal_len = if len == 0 {
            self.window_size
        } else {
            len.min(self.window_size)
        };
        self
    }

    /// A match of this length ends the candidate search immediately.
    pub fn with_nice_back_ref_len(mut self, len: usize) -> Self {
        self.nice_back_ref_len = Some(len);
        self
    }

    /// Limits how many hash chain candidates are examined per position.
    pub fn with_max_candidates(mut self, candidates: usize) -> Self {
        self.max_candidates = Some(candidates);
        self
    }

    /// Enables or disables the one position lazy match lookahead.
    pub fn with_lazy_matching(mut self, lazy: bool) -> Self {
        self.lazy_matching = Some(lazy);
        self
    }

    /// Matches no longer than this trigger the lazy lookahead.
    pub fn with_lazy_threshold(mut self, threshold: usize) -> Self {
        self.lazy_threshold = Some(threshold);
        self
    }

    /// Preset trading compression ratio for speed.
    pub fn tuned_for_speed(mut self) -> Self {
        self.nice_back_ref_len = Some((self.max_back_ref_len / 8).max(self.min_back_ref_len));
        self.max_candidates = Some((self.window_size / 1024).max(32));
        self.lazy_matching = Some(false);
        self.lazy_threshold = Some(self.min_back_ref_len);
        self
    }

    /// Preset trading speed for compression ratio.
    pub fn tuned_for_compression_ratio(mut self) -> Self {
        self.nice_back_ref_len = Some(self.max_back_ref_len);
        self.max_candidates = Some((self.window_size / 16).max(32));
        self.lazy_matching = Some(true);
        self.lazy_threshold = Some(self.max_back_ref_len);
        self
    }

    /// Validates the combination and returns the finished options.
    pub fn build(self) -> Result<Lz77Options, Error> {
        if self.window_size < 2 || !self.window_size.is_power_of_two() {
            return Err(Error::InvalidLz77Parameters(
                "window_size must be a power of two".into(),
            ));
        }
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(Error::InvalidLz77Parameters(
                "window_size too large".into(),
            ));
        }
        if self.min_back_ref_len > self.window_size {
            return Err(Error::InvalidLz77Parameters(
                "min_back_ref_len exceeds window_size".into(),
            ));
        }
        let min = self.min_back_ref_len;
        let max = self.max_back_ref_len.max(min);
        let nice = self
            .nice_back_ref_len
            .unwrap_or_else(|| (max / 2).max(min))
            .clamp(min, max);
        let candidates = self
            .max_candidates
            .unwrap_or_else(|| (self.window_size / 128).max(256))
            .max(1);
        let lazy = self.lazy_matching.unwrap_or(true);
        let threshold = if lazy {
            self.lazy_threshold.unwrap_or(nice).max(min)
        } else {
            min
        };
        Ok(Lz77Options {
            window_size: self.window_size,
            min_back_ref_len: min,
            max_back_ref_len: max,
            max_offset: self.max_offset.clamp(1, self.window_size - 1),
            max_literal_len: self.max_literal_len.clamp(1, self.window_size),
            nice_back_ref_len: nice,
            max_candidates: candidates,
            lazy_matching: lazy,
            lazy_threshold: threshold,
        })
    }
}

/// One unit of compressor output, delivered to the sink.
#[derive(Debug)]
pub enum Lz77Block<'a> {
    /// A run of bytes stored verbatim.
    ///
    /// The slice is a borrowed view into the compressor's window and is
    /// invalidated by the next call to [`Lz77Compressor::compress`] or
    /// [`Lz77Compressor::finish`]; copy it if it must outlive the callback.
    Literal(&'a [u8]),
    /// `length` bytes equal to the `length` bytes starting `offset` bytes
    /// before the current position.
    BackReference {
        /// Distance back from the current position, at least 1.
        offset: usize,
        /// Number of matched bytes.
        length: usize,
    },
    /// End of the stream; no further blocks follow.
    EndOfData,
}

/// The matcher.
///
/// Feed data with [`compress`](Self::compress), optionally seed the window
/// with [`prefill`](Self::prefill) first, and terminate the stream with
/// [`finish`](Self::finish). Blocks are pushed into the sink passed to each
/// call; the compressor holds no sink of its own so the caller keeps full
/// ownership of its output state between calls.
pub struct Lz77Compressor {
    options: Lz77Options,
    window: Vec<u8>,
    head: Vec<i32>,
    prev: Vec<i32>,
    w_size: i32,
    w_mask: i32,
    initialized: bool,
    current_position: i32,
    lookahead: i32,
    match_start: i32,
    block_start: i32,
    insert_hash: i32,
    missed_inserts: i32,
}

impl Lz77Compressor {
    /// Creates a compressor with the given options.
    pub fn new(options: Lz77Options) -> Self {
        let window_size = options.window_size;
        Self {
            options,
            window: vec![0; 2 * window_size],
            head: vec![NO_MATCH; HASH_SIZE],
            prev: vec![NO_MATCH; window_size],
            w_size: window_size as i32,
            w_mask: window_size as i32 - 1,
            initialized: false,
            current_position: 0,
            lookahead: 0,
            match_start: NO_MATCH,
            block_start: 0,
            insert_hash: 0,
            missed_inserts: 0,
        }
    }

    /// The options this compressor runs with.
    pub fn options(&self) -> &Lz77Options {
        &self.options
    }

    /// Feeds `data` into the matcher, emitting blocks into `sink` as they
    /// complete.
    pub fn compress<F>(&mut self, data: &[u8], sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let window_size = self.options.window_size;
        let mut chunk = data;
        while chunk.len() > window_size {
            self.do_compress(&chunk[..window_size], sink)?;
            chunk = &chunk[window_size..];
        }
        if !chunk.is_empty() {
            self.do_compress(chunk, sink)?;
        }
        Ok(())
    }

    /// Seeds the window with a dictionary: the last `window_size` bytes of
    /// `data` become match candidates for the stream that follows.
    ///
    /// Fails with [`Error::PrefillAfterStart`] once [`compress`] has
    /// accepted data.
    ///
    /// [`compress`]: Self::compress
    pub fn prefill(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.current_position != 0 || self.lookahead != 0 {
            return Err(Error::PrefillAfterStart);
        }
        let len = self.options.window_size.min(data.len());
        self.window[..len].copy_from_slice(&data[data.len() - len..]);
        if len >= HASH_BYTES as usize {
            self.initialize();
            let stop = len - HASH_BYTES as usize + 1;
            for i in 0..stop {
                self.insert_string(i as i32);
            }
            self.missed_inserts = HASH_BYTES - 1;
        } else {
            self.missed_inserts = len as i32;
        }
        self.current_position = len as i32;
        self.block_start = len as i32;
        Ok(())
    }

    /// Emits the final literal block and [`Lz77Block::EndOfData`].
    pub fn finish<F>(&mut self, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        if self.block_start != self.current_position || self.lookahead > 0 {
            self.current_position += self.lookahead;
            self.lookahead = 0;
            self.flush_literal_block(sink)?;
            self.block_start = self.current_position;
        }
        sink(Lz77Block::EndOfData).map_err(Error::io)
    }

    fn do_compress<F>(&mut self, data: &[u8], sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let space_left =
            self.window.len() as i32 - self.current_position - self.lookahead;
        if (data.len() as i32) > space_left {
            if self.current_position >= self.w_size {
                self.slide(sink)?;
            } else {
                // The lower half is still live so sliding would lose
                // positions; top the window up first, the next round can
                // slide normally.
                let (fit, rest) = data.split_at(space_left as usize);
                self.append_and_compress(fit, sink)?;
                return self.do_compress(rest, sink);
            }
        }
        self.append_and_compress(data, sink)
    }

    fn append_and_compress<F>(&mut self, data: &[u8], sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        if !data.is_empty() {
            let start = (self.current_position + self.lookahead) as usize;
            self.window[start..start + data.len()].copy_from_slice(data);
            self.lookahead += data.len() as i32;
        }
        if !self.initialized && self.lookahead >= self.options.min_back_ref_len as i32 {
            self.initialize();
        }
        if self.initialized {
            self.compress_window(sink)?;
        }
        Ok(())
    }

    /// Moves the upper half of the window down. Every index into the window
    /// moves down with it in lockstep; chain entries pointing into the
    /// discarded half become [`NO_MATCH`].
    fn slide<F>(&mut self, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let w = self.w_size;
        if self.block_start != self.current_position && self.block_start < w {
            self.flush_literal_block(sink)?;
            self.block_start = self.current_position;
        }
        self.window.copy_within(w as usize.., 0);
        self.current_position -= w;
        self.match_start -= w;
        self.block_start -= w;
        for head in self.head.iter_mut() {
            *head = if *head >= w { *head - w } else { NO_MATCH };
        }
        for prev in self.prev.iter_mut() {
            *prev = if *prev >= w { *prev - w } else { NO_MATCH };
        }
        Ok(())
    }

    fn initialize(&mut self) {
        for i in 0..HASH_BYTES as usize - 1 {
            self.insert_hash = next_hash(self.insert_hash, self.window[i]);
        }
        self.initialized = true;
    }

    fn compress_window<F>(&mut self, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let min_match = self.options.min_back_ref_len as i32;
        let lazy = self.options.lazy_matching;
        let lazy_threshold = self.options.lazy_threshold as i32;
        let max_offset = self.options.max_offset as i32;

        while self.lookahead >= min_match {
            self.catch_up_missed_inserts();
            let mut match_length = 0;
            let hash_head = self.insert_string(self.current_position);
            if hash_head != NO_MATCH && self.current_position - hash_head <= max_offset {
                match_length = self.longest_match(hash_head);
                if lazy && match_length <= lazy_threshold && self.lookahead > match_length {
                    match_length = self.longest_match_for_next_position(match_length);
                }
            }
            if match_length >= min_match {
                if self.block_start != self.current_position {
                    self.flush_literal_block(sink)?;
                }
                self.flush_back_reference(match_length, sink)?;
                self.insert_strings_in_match(match_length);
                self.lookahead -= match_length;
                self.current_position += match_length;
                self.block_start = self.current_position;
            } else {
                self.lookahead -= 1;
                self.current_position += 1;
                if self.current_position - self.block_start
                    >= self.options.max_literal_len as i32
                {
                    self.flush_literal_block(sink)?;
                    self.block_start = self.current_position;
                }
            }
        }
        Ok(())
    }

    /// Checks whether skipping one byte yields a strictly longer match.
    /// Rolls the window and hash state back when it does not.
    fn longest_match_for_next_position(&mut self, prev_match_length: i32) -> i32 {
        let prev_match_start = self.match_start;
        let prev_insert_hash = self.insert_hash;
        let max_offset = self.options.max_offset as i32;

        self.lookahead -= 1;
        self.current_position += 1;
        let mut match_length = 0;
        let hash_head = self.insert_string(self.current_position);
        if hash_head != NO_MATCH && self.current_position - hash_head <= max_offset {
            match_length = self.longest_match(hash_head);
        }
        if match_length <= prev_match_length {
            match_length = prev_match_length;
            self.match_start = prev_match_start;
            // undo the insert done for the peeked position
            self.head[self.insert_hash as usize] =
                self.prev[(self.current_position & self.w_mask) as usize];
            self.insert_hash = prev_insert_hash;
            self.current_position -= 1;
            self.lookahead += 1;
        }
        match_length
    }

    /// Walks the hash chain for the best match at the current position,
    /// updating `match_start` as a side effect.
    fn longest_match(&mut self, mut match_head: i32) -> i32 {
        let min_length = self.options.min_back_ref_len as i32;
        let mut longest_match_length = min_length - 1;
        let max_possible_length =
            (self.options.max_back_ref_len as i32).min(self.lookahead);
        let min_index = (self.current_position - self.options.max_offset as i32).max(0);
        let nice_len = (self.options.nice_back_ref_len as i32).min(max_possible_length);

        let mut candidates = 0;
        while candidates < self.options.max_candidates && match_head >= min_index {
            let mut current_length = 0;
            for i in 0..max_possible_length {
                if self.window[(match_head + i) as usize]
                    != self.window[(self.current_position + i) as usize]
                {
                    break;
                }
                current_length += 1;
            }
            if current_length > longest_match_length {
                longest_match_length = current_length;
                self.match_start = match_head;
                if current_length >= nice_len {
                    break;
                }
            }
            match_head = self.prev[(match_head & self.w_mask) as usize];
            candidates += 1;
        }
        longest_match_length
    }

    /// Inserts the three byte string at `pos` into the hash chains and
    /// returns the previous head of its chain.
    fn insert_string(&mut self, pos: i32) -> i32 {
        self.insert_hash = next_hash(
            self.insert_hash,
            self.window[(pos - 1 + HASH_BYTES) as usize],
        );
        let hash_head = self.head[self.insert_hash as usize];
        self.prev[(pos & self.w_mask) as usize] = hash_head;
        self.head[self.insert_hash as usize] = pos;
        hash_head
    }

    /// Inserts the positions covered by a match, as far as the lookahead
    /// provides hashable bytes; the rest is replayed later.
    fn insert_strings_in_match(&mut self, match_length: i32) {
        let stop = (match_length - 1).min(self.lookahead - HASH_BYTES);
        let mut i = 1;
        while i <= stop {
            self.insert_string(self.current_position + i);
            i += 1;
        }
        self.missed_inserts = match_length - stop - 1;
    }

    fn catch_up_missed_inserts(&mut self) {
        while self.missed_inserts > 0 {
            let pos = self.current_position - self.missed_inserts;
            self.missed_inserts -= 1;
            self.insert_string(pos);
        }
    }

    fn flush_literal_block<F>(&mut self, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let start = self.block_start as usize;
        let end = self.current_position as usize;
        sink(Lz77Block::Literal(&self.window[start..end])).map_err(Error::io)
    }

    fn flush_back_reference<F>(&mut self, match_length: i32, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(Lz77Block<'_>) -> std::io::Result<()>,
    {
        let offset = (self.current_position - self.match_start) as usize;
        sink(Lz77Block::BackReference {
            offset,
            length: match_length as usize,
        })
        .map_err(Error::io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Emitted {
        Literal(Vec<u8>),
        BackReference { offset: usize, length: usize },
        EndOfData,
    }

    fn run(options: Lz77Options, chunks: &[&[u8]]) -> Vec<Emitted> {
        let mut emitted = Vec::new();
        let mut compressor = Lz77Compressor::new(options);
        let mut sink = |block: Lz77Block<'_>| {
            emitted.push(match block {
                Lz77Block::Literal(data) => Emitted::Literal(data.to_vec()),
                Lz77Block::BackReference { offset, length } => {
                    Emitted::BackReference { offset, length }
                }
                Lz77Block::EndOfData => Emitted::EndOfData,
            });
            Ok(())
        };
        for chunk in chunks {
            compressor.compress(chunk, &mut sink).unwrap();
        }
        compressor.finish(&mut sink).unwrap();
        emitted
    }

    fn rebuild(emitted: &[Emitted]) -> Vec<u8> {
        let mut data: Vec<u8> = Vec::new();
        for block in emitted {
            match block {
                Emitted::Literal(bytes) => data.extend_from_slice(bytes),
                Emitted::BackReference { offset, length } => {
                    for _ in 0..*length {
                        data.push(data[data.len() - offset]);
                    }
                }
                Emitted::EndOfData => {}
            }
        }
        data
    }

    #[test]
    fn repeated_pattern_becomes_one_back_reference() {
        let options = Lz77Options::builder(16)
            .with_min_back_ref_len(3)
            .with_max_offset(15)
            .build()
            .unwrap();
        let emitted = run(options, &[b"abcdeabcdeabcde"]);
        assert_eq!(
            emitted,
            vec![
                Emitted::Literal(b"abcde".to_vec()),
                Emitted::BackReference {
                    offset: 5,
                    length: 10
                },
                Emitted::EndOfData,
            ]
        );
    }

    #[test]
    fn short_input_is_a_single_literal() {
        let options = Lz77Options::builder(32).build().unwrap();
        let emitted = run(options, &[b"ab"]);
        assert_eq!(
            emitted,
            vec![Emitted::Literal(b"ab".to_vec()), Emitted::EndOfData]
        );
    }

    #[test]
    fn empty_input_emits_only_end_of_data() {
        let options = Lz77Options::builder(32).build().unwrap();
        assert_eq!(run(options, &[]), vec![Emitted::EndOfData]);
    }

    #[test]
    fn emitted_blocks_reconstruct_the_input() {
        let mut data = Vec::new();
        for i in 0u32..4096 {
            // mildly repetitive input with phase jumps
            data.push((i % 251) as u8);
            if i % 97 == 0 {
                data.extend_from_slice(b"the quick brown fox");
            }
        }
        let options = Lz77Options::builder(1024).build().unwrap();
        let emitted = run(options, &[&data]);
        assert_eq!(rebuild(&emitted), data);
    }

    #[test]
    fn emitted_back_references_respect_the_parameters() {
        let options = Lz77Options::builder(256)
            .with_min_back_ref_len(4)
            .with_max_back_ref_len(32)
            .with_max_offset(128)
            .build()
            .unwrap();
        let (min, max, max_offset) = (4, 32, 128);
        let mut data = Vec::new();
        for i in 0u32..2048 {
            data.push((i % 7) as u8);
            data.push((i % 13) as u8);
        }
        for block in run(options, &[&data]) {
            if let Emitted::BackReference { offset, length } = block {
                assert!(length >= min && length <= max, "length {length}");
                assert!(offset >= 1 && offset <= max_offset, "offset {offset}");
            }
        }
    }

    #[test]
    fn input_larger_than_the_window_round_trips() {
        let options = Lz77Options::builder(64).build().unwrap();
        let mut data = Vec::new();
        for i in 0u32..1000 {
            data.push((i * 7 % 256) as u8);
            data.push((i % 3) as u8);
        }
        // feed in uneven chunks to exercise the slide paths
        let chunks: Vec<&[u8]> = data.chunks(61).collect();
        let emitted = run(options, &chunks);
        assert_eq!(rebuild(&emitted), data);
    }

    #[test]
    fn max_literal_len_splits_long_runs() {
        let options = Lz77Options::builder(64).with_max_literal_len(8).build().unwrap();
        let data: Vec<u8> = (0u8..32).collect(); // incompressible
        let emitted = run(options, &[&data]);
        for block in &emitted {
            if let Emitted::Literal(bytes) = block {
                assert!(bytes.len() <= 8, "literal of {} bytes", bytes.len());
            }
        }
        assert_eq!(rebuild(&emitted), data);
    }

    #[test]
    fn prefill_seeds_matches_from_the_dictionary() {
        let options = Lz77Options::builder(64).build().unwrap();
        let mut compressor = Lz77Compressor::new(options);
        compressor.prefill(b"abcdefgh").unwrap();
        let mut emitted = Vec::new();
        compressor
            .compress(b"abcdefgh", &mut |block: Lz77Block<'_>| {
                emitted.push(match block {
                    Lz77Block::Literal(d) => Emitted::Literal(d.to_vec()),
                    Lz77Block::BackReference { offset, length } => {
                        Emitted::BackReference { offset, length }
                    }
                    Lz77Block::EndOfData => Emitted::EndOfData,
                });
                Ok(())
            })
            .unwrap();
        assert!(
            emitted
                .iter()
                .any(|b| matches!(b, Emitted::BackReference { offset: 8, .. })),
            "expected a dictionary match, got {emitted:?}"
        );
    }

    #[test]
    fn prefill_after_data_is_rejected() {
        let options = Lz77Options::builder(64).build().unwrap();
        let mut compressor = Lz77Compressor::new(options);
        compressor.compress(b"x", &mut |_| Ok(())).unwrap();
        assert!(matches!(
            compressor.prefill(b"dict"),
            Err(Error::PrefillAfterStart)
        ));
    }

    #[test]
    fn window_size_must_be_a_power_of_two() {
        assert!(matches!(
            Lz77Options::builder(1000).build(),
            Err(Error::InvalidLz77Parameters(_))
        ));
        assert!(matches!(
            Lz77Options::builder(0).build(),
            Err(Error::InvalidLz77Parameters(_))
        ));
    }

    #[test]
    fn min_back_ref_len_is_clamped_to_hash_width() {
        let options = Lz77Options::builder(64).with_min_back_ref_len(1).build().unwrap();
        assert_eq!(options.min_back_ref_len(), 3);
    }
}
