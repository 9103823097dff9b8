//! One-shot `put` and `get` against a configured store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use blobrelay_core::{reader_stream, start_download, upload, Oid, Outcome, RelayConfig};
use blobrelay_server::{PgDirectory, PgStore, StoreDirectory};
use clap::Parser;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

#[derive(Parser, Debug)]
pub struct PutArgs {
    /// Store name from the [stores.*] config sections
    pub store: String,

    /// File to upload
    pub file: PathBuf,

    /// MIME type recorded in the receipt
    #[arg(long, default_value = "application/octet-stream")]
    pub mimetype: String,
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Store name from the [stores.*] config sections
    pub store: String,

    /// OID of the large object
    pub oid: Oid,

    /// Output file
    #[arg(long, short = 'o')]
    pub output: PathBuf,
}

pub async fn run_put(args: PutArgs, config_path: Option<&Path>) -> Result<()> {
    let config = RelayConfig::load(config_path)?;
    let directory = PgDirectory::new(config.stores.clone());
    let store = directory.resolve(&args.store)?;

    let file = tokio::fs::File::open(&args.file)
        .await
        .context(format!("Failed to open {}", args.file.display()))?;
    let filename = args
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());

    let transfer = config.transfer_config();
    let result = upload(
        &store,
        reader_stream(file, transfer.chunk_size),
        filename,
        args.mimetype,
        transfer,
    )
    .await;
    directory.shutdown().await;

    let receipt = result.context("Upload failed")?;
    tracing::info!(store = %args.store, oid = %receipt.oid, bytes = receipt.bytes, "uploaded");
    println!("{}", receipt.oid);
    Ok(())
}

pub async fn run_get(args: GetArgs, config_path: Option<&Path>) -> Result<()> {
    let config = RelayConfig::load(config_path)?;
    let directory = PgDirectory::new(config.stores.clone());
    let store = directory.resolve(&args.store)?;

    let result = download_to(&store, args.oid, &args.output, &config).await;
    directory.shutdown().await;

    if result.is_err() {
        // never leave a truncated file behind
        let _ = tokio::fs::remove_file(&args.output).await;
    }
    let bytes = result?;
    tracing::info!(store = %args.store, oid = %args.oid, bytes, "downloaded");
    Ok(())
}

async fn download_to(
    store: &PgStore,
    oid: Oid,
    output: &Path,
    config: &RelayConfig,
) -> Result<u64> {
    let download = start_download(store, oid, config.transfer_config())
        .await
        .context(format!("Failed to open large object {oid}"))?;

    let mut file = tokio::fs::File::create(output)
        .await
        .context(format!("Failed to create {}", output.display()))?;

    let mut body = download.body;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context(format!("Download of {oid} failed"))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    let outcome = download.task.await.context("Download task panicked")?;
    if outcome != Outcome::Success {
        bail!("Download of {oid} ended with {}", outcome.as_str());
    }
    Ok(written)
}
