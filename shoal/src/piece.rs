use crate::{Error, Result, TorrentInfo};

/// Wire-level block size. Every `request` uses this length except the
/// final block of the final piece.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceIdx(pub(crate) u32);

impl std::fmt::Display for PieceIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.0)
    }
}

impl From<PieceIdx> for u32 {
    fn from(value: PieceIdx) -> Self {
        value.0
    }
}

impl From<u32> for PieceIdx {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl PieceIdx {
    pub fn new(index: u32) -> Self {
        Self(index)
    }
}

/// Validate an incoming `request(index, begin, length)` against the
/// torrent geometry. The request must address an existing piece, ask
/// for at least one byte and stay inside the piece's effective length.
pub fn validate_request(
    info: &TorrentInfo,
    index: PieceIdx,
    begin: u32,
    length: u32,
) -> Result<()> {
    if !info.piece_index_valid(index) {
        return Err(Error::InvalidBlock(format!(
            "request for piece {} of {}",
            index.0,
            info.pieces_count()
        )));
    }
    if length == 0 {
        return Err(Error::InvalidBlock(format!("empty request in {index}")));
    }
    let piece_length = info.piece_length_from_index(index);
    if u64::from(begin) + u64::from(length) > u64::from(piece_length) {
        return Err(Error::InvalidBlock(format!(
            "request {}+{} exceeds {index} length {}",
            begin, length, piece_length
        )));
    }
    Ok(())
}

/// Validate a received `piece(index, begin, block)` payload. Blocks
/// must be aligned to [`BLOCK_LENGTH`] and exactly one block long; only
/// the final block of the final piece may be the shorter residual tail.
pub fn validate_block(
    info: &TorrentInfo,
    index: PieceIdx,
    begin: u32,
    block_len: usize,
) -> Result<()> {
    if !info.piece_index_valid(index) {
        return Err(Error::InvalidBlock(format!(
            "block for piece {} of {}",
            index.0,
            info.pieces_count()
        )));
    }
    if begin % BLOCK_LENGTH != 0 {
        return Err(Error::InvalidBlock(format!(
            "block offset {begin} in {index} is not aligned"
        )));
    }
    let piece_length = info.piece_length_from_index(index);
    let block_len = u64::from(u32::try_from(block_len).map_err(|_| {
        Error::InvalidBlock(format!("oversized block of {block_len} bytes in {index}"))
    })?);
    let end = u64::from(begin) + block_len;
    if block_len == 0 || end > u64::from(piece_length) {
        return Err(Error::InvalidBlock(format!(
            "block {}+{} exceeds {index} length {}",
            begin, block_len, piece_length
        )));
    }

    let is_tail = index.0 + 1 == info.pieces_count() && end == u64::from(piece_length);
    if block_len != u64::from(BLOCK_LENGTH) && !is_tail {
        return Err(Error::InvalidBlock(format!(
            "block of {block_len} bytes at {begin} in {index} is not a full block"
        )));
    }
    Ok(())
}

#[derive(Default, Clone, PartialEq, Eq)]
pub struct PieceBitfield {
    data: Vec<u8>,
    size: u32,
}

impl PieceBitfield {
    pub fn new() -> Self {
        Default::default()
    }

    /// `size` is the number of pieces the bitfield tracks.
    pub fn with_size(size: u32) -> Self {
        let data = vec![0u8; Self::required_byte_len(size)];
        Self { data, size }
    }

    /// Reinterpret wire bytes as a bitfield of `size` pieces. The byte
    /// vector is clamped or zero-extended to `ceil(size / 8)`.
    pub fn from_vec(bytes: Vec<u8>, size: u32) -> Self {
        let mut data = bytes;
        data.resize(Self::required_byte_len(size), 0);
        Self { data, size }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn has_piece(&self, index: PieceIdx) -> bool {
        let (byte_index, bit_index) = self.indices(index.0);
        (self.data[byte_index] & (1 << bit_index)) > 0
    }

    pub fn set_piece(&mut self, index: PieceIdx) {
        let (byte_index, bit_index) = self.indices(index.0);
        self.data[byte_index] |= 1 << bit_index;
    }

    pub fn unset_piece(&mut self, index: PieceIdx) {
        let (byte_index, bit_index) = self.indices(index.0);
        self.data[byte_index] &= !(1 << bit_index);
    }

    pub fn num_set(&self) -> u32 {
        self.pieces().count() as u32
    }

    pub fn fill(&mut self) {
        for i in 0..self.size {
            self.set_piece(PieceIdx::from(i));
        }
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0);
    }

    pub fn complete(&self) -> bool {
        (0..self.size).all(|i| self.has_piece(PieceIdx::from(i)))
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pieces this bitfield contains.
    pub fn pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .map(PieceIdx::new)
            .filter(move |&p| self.has_piece(p))
    }

    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIdx> + '_ {
        (0..self.len())
            .map(PieceIdx::new)
            .filter(move |&p| !self.has_piece(p))
    }

    /// Pieces missing here that `other` has.
    pub fn missing_pieces_in<'s>(&'s self, other: &'s Self) -> impl Iterator<Item = PieceIdx> + 's {
        (0..self.len().min(other.len()))
            .map(PieceIdx::new)
            .filter(move |&p| !self.has_piece(p) && other.has_piece(p))
    }

    pub fn contains_missing_in(&self, other: &Self) -> bool {
        other.missing_pieces_in(self).next().is_some()
    }

    // (byte_index, bit_index); bit 0 of the field is the MSB of byte 0
    fn indices(&self, index: u32) -> (usize, usize) {
        if index >= self.size {
            panic!("bitfield of {} pieces indexed at {}", self.size, index);
        }
        let byte_index = index as usize / 8;
        let bit_index = 7 - index as usize % 8;
        (byte_index, bit_index)
    }

    fn required_byte_len(num_bits: u32) -> usize {
        (num_bits as usize + 7) / 8
    }
}

impl std::fmt::Debug for PieceBitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceBitfield")
            .field("pieces", &self.size)
            .field("set", &self.num_set())
            .finish()
    }
}

impl AsRef<[u8]> for PieceBitfield {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
