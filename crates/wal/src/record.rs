//! Log record encoding.

use common::{DbError, DbResult, Lsn, PageId, TxId};

/// Fixed header bytes before the old/new data images.
pub const RECORD_HEADER_SIZE: usize = 35;

const CRC_OFFSET: usize = 31;

/// What a log record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Update = 4,
    Checkpoint = 5,
}

impl TryFrom<u8> for WalRecordType {
    type Error = DbError;

    fn try_from(value: u8) -> DbResult<Self> {
        match value {
            1 => Ok(WalRecordType::Begin),
            2 => Ok(WalRecordType::Commit),
            3 => Ok(WalRecordType::Abort),
            4 => Ok(WalRecordType::Update),
            5 => Ok(WalRecordType::Checkpoint),
            other => Err(DbError::FileCorrupted(format!(
                "unknown wal record type byte {other:#04x}"
            ))),
        }
    }
}

/// One write-ahead log record.
///
/// Frame layout (little-endian): `0..8` LSN, `8..16` transaction id,
/// `16` type, `17..25` page id, `25..27` payload offset, `27..29` old-data
/// length, `29..31` new-data length, `31..35` CRC-32-IEEE over the whole
/// frame with these four bytes zeroed, then the old and new images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub record_type: WalRecordType,
    pub page_id: PageId,
    pub offset: u16,
    pub old_data: Vec<u8>,
    pub new_data: Vec<u8>,
}

impl WalRecord {
    pub fn begin(tx_id: TxId) -> Self {
        Self::control(tx_id, WalRecordType::Begin)
    }

    pub fn commit(tx_id: TxId) -> Self {
        Self::control(tx_id, WalRecordType::Commit)
    }

    pub fn abort(tx_id: TxId) -> Self {
        Self::control(tx_id, WalRecordType::Abort)
    }

    pub fn update(
        tx_id: TxId,
        page_id: PageId,
        offset: u16,
        old_data: Vec<u8>,
        new_data: Vec<u8>,
    ) -> Self {
        Self {
            lsn: 0,
            tx_id,
            record_type: WalRecordType::Update,
            page_id,
            offset,
            old_data,
            new_data,
        }
    }

    pub fn checkpoint(data: &CheckpointData) -> Self {
        Self {
            lsn: 0,
            tx_id: 0,
            record_type: WalRecordType::Checkpoint,
            page_id: PageId(0),
            offset: 0,
            old_data: Vec::new(),
            new_data: data.encode(),
        }
    }

    fn control(tx_id: TxId, record_type: WalRecordType) -> Self {
        Self {
            lsn: 0,
            tx_id,
            record_type,
            page_id: PageId(0),
            offset: 0,
            old_data: Vec::new(),
            new_data: Vec::new(),
        }
    }

    /// Serialize into a framed byte image with an embedded CRC.
    ///
    /// # Errors
    ///
    /// `WalRecordLength` when either data image exceeds 65535 bytes.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        if self.old_data.len() > u16::MAX as usize {
            return Err(DbError::WalRecordLength(self.old_data.len()));
        }
        if self.new_data.len() > u16::MAX as usize {
            return Err(DbError::WalRecordLength(self.new_data.len()));
        }

        let mut buf = vec![0u8; RECORD_HEADER_SIZE + self.old_data.len() + self.new_data.len()];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tx_id.to_le_bytes());
        buf[16] = self.record_type as u8;
        buf[17..25].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[25..27].copy_from_slice(&self.offset.to_le_bytes());
        buf[27..29].copy_from_slice(&(self.old_data.len() as u16).to_le_bytes());
        buf[29..31].copy_from_slice(&(self.new_data.len() as u16).to_le_bytes());
        buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + self.old_data.len()]
            .copy_from_slice(&self.old_data);
        buf[RECORD_HEADER_SIZE + self.old_data.len()..].copy_from_slice(&self.new_data);

        let crc = crc32fast::hash(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse a frame, verifying its length bookkeeping and CRC.
    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(DbError::FileCorrupted("short wal frame".into()));
        }
        let lsn = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let old_len = u16::from_le_bytes(buf[27..29].try_into().expect("2 bytes")) as usize;
        let new_len = u16::from_le_bytes(buf[29..31].try_into().expect("2 bytes")) as usize;
        if buf.len() != RECORD_HEADER_SIZE + old_len + new_len {
            return Err(DbError::FileCorrupted(format!(
                "wal frame length {} does not match recorded images ({old_len} + {new_len})",
                buf.len()
            )));
        }

        let stored_crc = u32::from_le_bytes(buf[CRC_OFFSET..CRC_OFFSET + 4].try_into().expect("4 bytes"));
        let mut zeroed = buf.to_vec();
        zeroed[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        if crc32fast::hash(&zeroed) != stored_crc {
            return Err(DbError::WalRecordChecksum(lsn));
        }

        Ok(Self {
            lsn,
            tx_id: u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes")),
            record_type: WalRecordType::try_from(buf[16])?,
            page_id: PageId(u64::from_le_bytes(buf[17..25].try_into().expect("8 bytes"))),
            offset: u16::from_le_bytes(buf[25..27].try_into().expect("2 bytes")),
            old_data: buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + old_len].to_vec(),
            new_data: buf[RECORD_HEADER_SIZE + old_len..].to_vec(),
        })
    }
}

/// Snapshot of live state carried in a `Checkpoint` record's new-data image.
///
/// Layout: `0..8` Unix-nanos timestamp, `8..16` last LSN, then a u32 count
/// of active transaction ids (u64 each), then a u32 count of dirty page ids
/// (u64 each).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointData {
    pub timestamp_nanos: u64,
    pub last_lsn: Lsn,
    pub active_tx_ids: Vec<TxId>,
    pub dirty_page_ids: Vec<PageId>,
}

impl CheckpointData {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            24 + 8 * (self.active_tx_ids.len() + self.dirty_page_ids.len()),
        );
        buf.extend_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf.extend_from_slice(&self.last_lsn.to_le_bytes());
        buf.extend_from_slice(&(self.active_tx_ids.len() as u32).to_le_bytes());
        for tx in &self.active_tx_ids {
            buf.extend_from_slice(&tx.to_le_bytes());
        }
        buf.extend_from_slice(&(self.dirty_page_ids.len() as u32).to_le_bytes());
        for page in &self.dirty_page_ids {
            buf.extend_from_slice(&page.0.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let corrupt = || DbError::InvalidCheckpoint("truncated checkpoint payload".into());
        if buf.len() < 20 {
            return Err(corrupt());
        }
        let timestamp_nanos = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let last_lsn = u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));

        let mut pos = 16;
        let tx_count = u32::from_le_bytes(buf[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += 4;
        let mut active_tx_ids = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let end = pos + 8;
            active_tx_ids.push(u64::from_le_bytes(
                buf.get(pos..end).ok_or_else(corrupt)?.try_into().expect("8 bytes"),
            ));
            pos = end;
        }

        let count_end = pos + 4;
        let page_count = u32::from_le_bytes(
            buf.get(pos..count_end).ok_or_else(corrupt)?.try_into().expect("4 bytes"),
        ) as usize;
        pos = count_end;
        let mut dirty_page_ids = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let end = pos + 8;
            dirty_page_ids.push(PageId(u64::from_le_bytes(
                buf.get(pos..end).ok_or_else(corrupt)?.try_into().expect("8 bytes"),
            )));
            pos = end;
        }

        Ok(Self {
            timestamp_nanos,
            last_lsn,
            active_tx_ids,
            dirty_page_ids,
        })
    }
}
