//! Append-only result records and their sinks
//!
//! Each record kind maps to one CSV file with a header row:
//! - accounts: `private_key,address`
//! - planned transfers: `frm,to`
//! - tx results: `frm,to,tx_hash,timestamp,gas_price,block_at_submit`
//! - block stats: `block_number,block_timestamp,my_timestamp,...`
//! - tx latency: tx result columns, `gas_used,block_number`, then
//!   `timestamp_i,self_timestamp_i` for the inclusion block and the 11 after it

use crate::error::LoadResult;

use ethers::types::{Address, H256, U256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A row that can be written to a result file
pub trait CsvRecord {
    const HEADER: &'static [&'static str];

    fn to_row(&self) -> Vec<String>;
}

/// Exported account credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub private_key: String,
    pub address: Address,
}

impl CsvRecord for AccountRecord {
    const HEADER: &'static [&'static str] = &["private_key", "address"];

    fn to_row(&self) -> Vec<String> {
        vec![self.private_key.clone(), format!("{:?}", self.address)]
    }
}

/// One scheduled load transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub from: Address,
    pub to: Address,
}

impl CsvRecord for PlannedTransfer {
    const HEADER: &'static [&'static str] = &["frm", "to"];

    fn to_row(&self) -> Vec<String> {
        vec![format!("{:?}", self.from), format!("{:?}", self.to)]
    }
}

/// One submitted load transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub from: Address,
    pub to: Address,
    pub tx_hash: H256,
    /// Unix seconds at submission
    pub submitted_at: i64,
    /// Wei
    pub gas_price: U256,
    /// Head published by the block monitor at submission
    pub block_at_submit: u64,
}

impl CsvRecord for TxResult {
    const HEADER: &'static [&'static str] =
        &["frm", "to", "tx_hash", "timestamp", "gas_price", "block_at_submit"];

    fn to_row(&self) -> Vec<String> {
        vec![
            format!("{:?}", self.from),
            format!("{:?}", self.to),
            format!("{:?}", self.tx_hash),
            self.submitted_at.to_string(),
            self.gas_price.to_string(),
            self.block_at_submit.to_string(),
        ]
    }
}

/// Statistics for one observed block. Gas prices are in gwei.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStat {
    pub block_number: u64,
    /// Miner-reported unix seconds
    pub block_timestamp: i64,
    /// Local unix seconds when first observed
    pub observed_timestamp: i64,
    pub timestamp_delta: i64,
    pub tx_count: usize,
    pub avg_gas_price: f64,
    pub median_gas_price: f64,
    pub q5_gas_price: f64,
    pub q95_gas_price: f64,
}

impl CsvRecord for BlockStat {
    const HEADER: &'static [&'static str] = &[
        "block_number",
        "block_timestamp",
        "my_timestamp",
        "timestamp_delta",
        "tx_count",
        "avg_gas_price",
        "median_gas_price",
        "q5_gas_price",
        "q95_gas_price",
    ];

    fn to_row(&self) -> Vec<String> {
        vec![
            self.block_number.to_string(),
            self.block_timestamp.to_string(),
            self.observed_timestamp.to_string(),
            self.timestamp_delta.to_string(),
            self.tx_count.to_string(),
            self.avg_gas_price.to_string(),
            self.median_gas_price.to_string(),
            self.q5_gas_price.to_string(),
            self.q95_gas_price.to_string(),
        ]
    }
}

/// Blocks, starting at the inclusion block, whose timestamps are joined to
/// each mined load transaction
pub const LATENCY_BLOCKS: u64 = 12;

/// When a block was produced and when this run first saw it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTimes {
    /// Miner-reported unix seconds
    pub block_timestamp: i64,
    /// Local unix seconds; `None` if the block monitor never observed it
    pub observed_timestamp: Option<i64>,
}

/// Receipt data for a mined load transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedTx {
    pub gas_used: U256,
    pub block_number: u64,
    /// `LATENCY_BLOCKS` entries from `block_number` upward
    pub blocks: Vec<BlockTimes>,
}

/// A submitted load transaction joined with its inclusion timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLatency {
    pub tx: TxResult,
    /// `None` if no receipt was obtained
    pub mined: Option<MinedTx>,
}

impl CsvRecord for TxLatency {
    const HEADER: &'static [&'static str] = &[
        "frm",
        "to",
        "tx_hash",
        "timestamp",
        "gas_price",
        "block_at_submit",
        "gas_used",
        "block_number",
        "timestamp_1",
        "self_timestamp_1",
        "timestamp_2",
        "self_timestamp_2",
        "timestamp_3",
        "self_timestamp_3",
        "timestamp_4",
        "self_timestamp_4",
        "timestamp_5",
        "self_timestamp_5",
        "timestamp_6",
        "self_timestamp_6",
        "timestamp_7",
        "self_timestamp_7",
        "timestamp_8",
        "self_timestamp_8",
        "timestamp_9",
        "self_timestamp_9",
        "timestamp_10",
        "self_timestamp_10",
        "timestamp_11",
        "self_timestamp_11",
        "timestamp_12",
        "self_timestamp_12",
    ];

    fn to_row(&self) -> Vec<String> {
        let mut row = self.tx.to_row();
        if let Some(mined) = &self.mined {
            row.push(mined.gas_used.to_string());
            row.push(mined.block_number.to_string());
            for times in &mined.blocks {
                row.push(times.block_timestamp.to_string());
                row.push(times.observed_timestamp.map(|t| t.to_string()).unwrap_or_default());
            }
        }
        // unmined transactions keep empty receipt columns
        row.resize(Self::HEADER.len(), String::new());
        row
    }
}

/// Append-only destination for records
pub trait ResultSink<R>: Send + Sync {
    fn append(&self, record: &R) -> LoadResult<()>;

    fn append_all(&self, records: &[R]) -> LoadResult<()> {
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }
}

/// CSV file sink. Writes the header on creation; one line per append.
pub struct CsvWriter<R> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn(&R)>,
}

impl<R: CsvRecord> CsvWriter<R> {
    pub fn create(path: impl AsRef<Path>) -> LoadResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        writeln!(file, "{}", R::HEADER.join(","))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }

    /// `{dir}/{kind}.{run_id}.csv`
    pub fn in_dir(dir: &Path, kind: &str, run_id: &str) -> LoadResult<Self> {
        Self::create(dir.join(format!("{}.{}.csv", kind, run_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_lines(&self, lines: &str) -> LoadResult<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| crate::error::LoadError::Internal("CSV writer lock poisoned".into()))?;
        file.write_all(lines.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl<R: CsvRecord> ResultSink<R> for CsvWriter<R> {
    fn append(&self, record: &R) -> LoadResult<()> {
        let row = record.to_row();
        debug_assert_eq!(row.len(), R::HEADER.len());
        self.write_lines(&format!("{}\n", row.join(",")))
    }

    fn append_all(&self, records: &[R]) -> LoadResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for record in records {
            lines.push_str(&record.to_row().join(","));
            lines.push('\n');
        }
        self.write_lines(&lines)
    }
}

/// Run identifier used in result file names
pub fn run_id() -> String {
    chrono::Local::now().format("%Y-%m-%d.%H:%M:%S").to_string()
}

/// In-memory sink for tests
#[cfg(test)]
pub struct MemorySink<R> {
    records: Mutex<Vec<R>>,
}

#[cfg(test)]
impl<R: Clone> MemorySink<R> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<R> {
        self.records.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl<R: Clone + Send> ResultSink<R> for MemorySink<R> {
    fn append(&self, record: &R) -> LoadResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
