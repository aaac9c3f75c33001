#![forbid(unsafe_code)]
//! Scenario harness: assembles the full ledgerfs core (devices → log →
//! cache → transactions → allocation map) over in-memory devices, and adds
//! the crash-simulation and log-inspection hooks the conformance tests use.
//!
//! A "crash" here is a snapshot of the map device: the persistent image is
//! exactly what reached the device at the snapshot instant. Reopening the
//! snapshot shows what an integrity check would find.

use anyhow::{Context, Result};
use lfs_bmap::BlockMap;
use lfs_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, MemByteDevice, MetaBufferPool, MetaPoolConfig,
};
use lfs_log::LogManager;
use lfs_ondisk::{LogPage, LogRecord};
use lfs_txn::{CommitMode, MapSink, TxnConfig, TxnManager};
use lfs_types::{BlockAddr, LOG_DATA_SLOT, LOGPSIZE, PSIZE, TxId};
use serde::Serialize;
use std::sync::Arc;

pub use lfs_bmap::BMAP_INODE as MAP_INODE;

/// A fully wired in-memory ledgerfs core.
pub struct Harness {
    pub map: Arc<BlockMap>,
    pub txn: Arc<TxnManager>,
    pub log: Arc<LogManager>,
    map_dev: Arc<ByteBlockDevice<MemByteDevice>>,
    log_dev: Arc<MemByteDevice>,
}

/// Summary of a scenario run, for JSON reports.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub commits: u64,
    pub group_commit_writes: u64,
    pub checkpoints: u64,
}

impl Harness {
    /// Format and open a core with `total_blocks` of managed space and a
    /// log of `log_pages` pages.
    pub fn new(total_blocks: u64, log_pages: usize) -> Result<Self> {
        let map_pages = BlockMap::required_device_blocks(total_blocks)
            .context("derive map geometry")?;
        let map_dev = Arc::new(
            ByteBlockDevice::new(
                MemByteDevice::new(usize::try_from(map_pages)? * PSIZE),
                u32::try_from(PSIZE)?,
            )
            .context("map device")?,
        );
        BlockMap::format(map_dev.as_ref(), total_blocks).context("format map")?;
        let map = Arc::new(
            BlockMap::open(Arc::clone(&map_dev) as Arc<dyn BlockDevice>).context("open map")?,
        );

        let log_dev = Arc::new(MemByteDevice::new(log_pages * LOGPSIZE));
        LogManager::format(log_dev.as_ref(), u32::try_from(PSIZE)?).context("format log")?;
        let log = Arc::new(
            LogManager::open(Arc::clone(&log_dev) as Arc<dyn ByteDevice>).context("open log")?,
        );

        let cache = Arc::new(MetaBufferPool::new(
            Arc::clone(&map_dev) as Arc<dyn BlockDevice>,
            MetaPoolConfig::default(),
        ));
        let txn = Arc::new(TxnManager::new(
            Arc::clone(&log),
            cache,
            Arc::clone(&map) as Arc<dyn MapSink>,
            TxnConfig::default(),
        ));

        Ok(Self {
            map,
            txn,
            log,
            map_dev,
            log_dev,
        })
    }

    /// Allocate in a one-shot transaction with the given commit mode.
    pub fn alloc_commit(
        &self,
        hint: Option<BlockAddr>,
        nblocks: u64,
        mode: CommitMode,
    ) -> lfs_error::Result<BlockAddr> {
        let tid = self.txn.begin()?;
        match self.map.alloc(&self.txn, tid, hint, nblocks) {
            Ok(addr) => {
                self.txn.commit(tid, mode)?;
                self.txn.end(tid)?;
                Ok(addr)
            }
            Err(e) => {
                self.txn.abort(tid)?;
                self.txn.end(tid)?;
                Err(e)
            }
        }
    }

    /// Free in a one-shot sync transaction.
    pub fn free_commit(&self, addr: BlockAddr, nblocks: u64) -> lfs_error::Result<()> {
        let tid = self.txn.begin()?;
        self.map.free(&self.txn, tid, addr, nblocks)?;
        self.txn.commit(tid, CommitMode::Sync)?;
        self.txn.end(tid)?;
        Ok(())
    }

    /// Snapshot the map device: the bytes a crash at this instant would
    /// leave on disk.
    #[must_use]
    pub fn crash_image(&self) -> Vec<u8> {
        self.map_dev.inner().snapshot()
    }

    /// Open an allocation map from a crash image.
    pub fn reopen_map(image: Vec<u8>) -> Result<BlockMap> {
        let dev = ByteBlockDevice::new(MemByteDevice::from_bytes(image), u32::try_from(PSIZE)?)
            .context("image device")?;
        Ok(BlockMap::open(Arc::new(dev) as Arc<dyn BlockDevice>).context("reopen map")?)
    }

    /// Decode every intact log page in sequence order, returning the packed
    /// records as `(page_seq, position_in_log, record, tid)`.
    pub fn log_records(&self) -> Result<Vec<(u64, usize, LogRecord, TxId)>> {
        let len = self.log_dev.len_bytes();
        let slots = len / LOGPSIZE as u64 - LOG_DATA_SLOT;
        let mut pages = Vec::new();
        for slot in 0..slots {
            let mut raw = vec![0_u8; LOGPSIZE];
            self.log_dev
                .read_exact_at((LOG_DATA_SLOT + slot) * LOGPSIZE as u64, &mut raw)
                .context("read log slot")?;
            // Unwritten or torn slots are not part of the intact record
            // stream.
            if let Ok(page) = LogPage::decode(&raw) {
                if page.page_seq > 0 {
                    pages.push(page);
                }
            }
        }
        pages.sort_by_key(|p| p.page_seq);

        let mut out = Vec::new();
        let mut position = 0_usize;
        for page in pages {
            for (record, tid) in
                LogRecord::decode_page(&page).context("decode log records")?
            {
                out.push((u64::from(page.page_seq), position, record, tid));
                position += 1;
            }
        }
        Ok(out)
    }

    /// Build a report row for JSON scenario output.
    #[must_use]
    pub fn report(&self, name: &str) -> ScenarioReport {
        let txn = self.txn.stats();
        let log = self.log.stats();
        ScenarioReport {
            name: name.to_owned(),
            total_blocks: self.map.total_blocks(),
            free_blocks: self.map.free_blocks(),
            commits: txn.commits,
            group_commit_writes: log.group_commit_writes,
            checkpoints: txn.checkpoints,
        }
    }
}
