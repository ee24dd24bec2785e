// The 7z specification calls this structure a "folder". The 7zip UI calls it
// a "block", which clashes less with filesystem folders, so this crate does
// too.

/// A coder pipeline and the entries compressed through it.
///
/// A block owns an ordered list of coders wired together by bind pairs.
/// Exactly one coder input is fed from a raw pack stream; the remaining
/// inputs consume the outputs of other coders. With solid compression a
/// single block carries many entries laid out back to back on its decoded
/// stream.
#[derive(Debug, Default, Clone)]
pub struct Block {
    /// The coders of this block, in declared order.
    pub coders: Vec<Coder>,
    /// Whether a CRC-32 of the decoded stream is stored.
    pub has_crc: bool,
    /// CRC-32 of the decoded stream.
    pub crc: u32,
    pub(crate) total_input_streams: usize,
    pub(crate) total_output_streams: usize,
    pub(crate) bind_pairs: Vec<BindPair>,
    pub(crate) packed_streams: Vec<u64>,
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) num_unpack_sub_streams: usize,
}

impl Block {
    pub(crate) fn find_bind_pair_for_in_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        self.bind_pairs.iter().position(|bp| bp.in_index == index)
    }

    pub(crate) fn find_bind_pair_for_out_stream(&self, index: usize) -> Option<usize> {
        let index = index as u64;
        self.bind_pairs.iter().position(|bp| bp.out_index == index)
    }

    /// Returns the size of the fully decoded stream of this block, the size
    /// of the output stream no bind pair consumes.
    pub fn unpack_size(&self) -> u64 {
        for i in (0..self.total_output_streams).rev() {
            if self.find_bind_pair_for_out_stream(i).is_none() {
                return self.unpack_sizes[i];
            }
        }
        0
    }

    /// Returns the declared output size of the coder at `index`.
    pub fn unpack_size_at_index(&self, index: usize) -> u64 {
        self.unpack_sizes.get(index).copied().unwrap_or_default()
    }

    /// Walks the coders in decoding order: starting at the coder fed by the
    /// pack stream and following the bind pairs outwards.
    pub fn ordered_coder_iter(&self) -> OrderedCoderIter<'_> {
        OrderedCoderIter {
            block: self,
            current: self.packed_streams.first().copied(),
        }
    }
}

/// One coder of a block's pipeline: a method ID plus opaque properties.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Coder {
    pub(crate) method_id: [u8; 4],
    pub(crate) id_len: usize,
    pub(crate) num_in_streams: u64,
    pub(crate) num_out_streams: u64,
    /// Method specific properties, e.g. the dictionary size for LZMA.
    pub properties: Vec<u8>,
}

impl Coder {
    /// Returns the method ID bytes of this coder.
    pub fn method_id(&self) -> &[u8] {
        &self.method_id[..self.id_len]
    }

    pub(crate) fn method_id_mut(&mut self) -> &mut [u8] {
        &mut self.method_id[..self.id_len]
    }
}

/// Connects the output stream `out_index` of one coder to the input stream
/// `in_index` of another.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BindPair {
    pub(crate) in_index: u64,
    pub(crate) out_index: u64,
}

/// Iterator over a block's coders in decoding order.
pub struct OrderedCoderIter<'a> {
    block: &'a Block,
    current: Option<u64>,
}

impl<'a> Iterator for OrderedCoderIter<'a> {
    type Item = (usize, &'a Coder);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current? as usize;
        self.current = self
            .block
            .find_bind_pair_for_out_stream(index)
            .map(|bp| self.block.bind_pairs[bp].in_index);
        self.block.coders.get(index).map(|coder| (index, coder))
    }
}
