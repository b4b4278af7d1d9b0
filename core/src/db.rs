use anyhow::{Context, Result};
use rocksdb::{DB, Options, WriteBatch, WriteOptions};
use std::path::Path;

/// Open (or create) the chain database under `path`.
pub fn open_db(path: &Path) -> Result<DB> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    DB::open(&opts, path)
        .with_context(|| format!("opening chain database at {}", path.display()))
}

/// Commit a batch with fsync; block application must survive power loss.
pub fn put_batch(db: &DB, batch: WriteBatch) -> Result<()> {
    let mut write_opts = WriteOptions::default();
    write_opts.set_sync(true);
    db.write_opt(batch, &write_opts)
        .context("committing write batch")
}
