//! The constant/string heap: interned bytes addressable by token.

use microclr_asm::Token;

use crate::error::EngineFault;
use crate::flash::ImageReader;
use crate::table::{SortedTable, TableEntry};

/// One interned constant. String constants hold UTF-16LE code units, other
/// constants raw initializer bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantEntry {
    /// The constant's token.
    pub token: Token,
    /// Total length announced by the host; uploads may arrive chunked.
    pub expected_len: u32,
    /// The bytes received so far.
    pub bytes: Vec<u8>,
}

impl ConstantEntry {
    /// True once every announced byte arrived.
    pub fn is_complete(&self) -> bool {
        self.bytes.len() as u32 == self.expected_len
    }
}

impl TableEntry for ConstantEntry {
    fn key(&self) -> u32 {
        self.token
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytes);
    }

    fn read_from(reader: &mut ImageReader<'_>) -> Result<Self, EngineFault> {
        let token = reader.read_u32()?;
        let len = reader.read_u32()?;
        let bytes = reader.read_bytes(len as usize)?.to_vec();
        Ok(Self {
            token,
            expected_len: len,
            bytes,
        })
    }
}

/// The append-only constant heap.
#[derive(Debug, Default)]
pub struct ConstantHeap {
    entries: SortedTable<ConstantEntry>,
}

impl ConstantHeap {
    /// An empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Splice an upload chunk. The first chunk (offset 0) creates the
    /// entry; later chunks must arrive in order and stay within the
    /// announced length.
    pub fn insert_chunk(
        &mut self,
        token: Token,
        total_len: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), &'static str> {
        if offset == 0 {
            if data.len() as u32 > total_len {
                return Err("chunk longer than announced constant");
            }
            self.entries.insert(ConstantEntry {
                token,
                expected_len: total_len,
                bytes: data.to_vec(),
            });
            return Ok(());
        }
        let entry = self
            .entries
            .get_mut_by_key(token)
            .ok_or("constant chunk for unknown token")?;
        if entry.bytes.len() as u32 != offset {
            return Err("constant chunk out of order");
        }
        if offset + data.len() as u32 > entry.expected_len {
            return Err("chunk past announced constant length");
        }
        entry.bytes.extend_from_slice(data);
        Ok(())
    }

    /// The bytes of a constant.
    pub fn get(&self, token: Token) -> Option<&[u8]> {
        self.entries.get_by_key(token).map(|e| e.bytes.as_slice())
    }

    /// Access to the backing table, for freeze and reload.
    pub fn table(&mut self) -> &mut SortedTable<ConstantEntry> {
        &mut self.entries
    }

    /// Drop loaded constants.
    pub fn clear(&mut self, including_flash: bool) {
        self.entries.clear(including_flash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_upload_reassembles() {
        let mut heap = ConstantHeap::new();
        heap.insert_chunk(0x7000_0001, 6, 0, &[1, 2, 3]).unwrap();
        heap.insert_chunk(0x7000_0001, 6, 3, &[4, 5, 6]).unwrap();
        assert_eq!(heap.get(0x7000_0001), Some(&[1, 2, 3, 4, 5, 6][..]));
    }

    #[test]
    fn out_of_order_chunks_are_rejected() {
        let mut heap = ConstantHeap::new();
        heap.insert_chunk(5, 8, 0, &[0; 4]).unwrap();
        assert!(heap.insert_chunk(5, 8, 6, &[0; 2]).is_err());
        assert!(heap.insert_chunk(5, 8, 4, &[0; 8]).is_err());
        assert!(heap.insert_chunk(6, 8, 4, &[0; 2]).is_err());
    }
}
