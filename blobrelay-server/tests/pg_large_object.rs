//! Large-object round trips against a live PostgreSQL.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::io;

use blobrelay_core::{
    reader_stream, start_download, upload, Oid, TransferConfig, TransferError,
};
use blobrelay_server::PgStore;
use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("connect");
    PgStore::new(pool, "test")
}

#[tokio::test]
#[ignore = "requires database"]
async fn upload_and_download_round_trip() {
    let store = store().await;
    let config = TransferConfig {
        chunk_size: 64 * 1024,
        channel_depth: 1,
    };
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

    let source = reader_stream(io::Cursor::new(data.clone()), config.chunk_size);
    let receipt = upload(&store, source, "blob.bin", "application/octet-stream", config)
        .await
        .unwrap();
    assert_eq!(receipt.bytes, data.len() as u64);

    let download = start_download(&store, receipt.oid, config).await.unwrap();
    assert_eq!(download.size, data.len() as u64);
    let chunks: Vec<_> = download.body.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), data);

    sqlx::query("SELECT lo_unlink($1)")
        .bind(sqlx::postgres::types::Oid(receipt.oid.get()))
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires database"]
async fn missing_object_is_not_found() {
    let store = store().await;
    let err = start_download(&store, Oid::new(999_999_999).unwrap(), TransferConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound { .. }), "{err:?}");
}
