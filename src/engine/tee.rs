// Tee writer — forwards origin chunks to the requester while persisting them to disk.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cache::temp_path_for;
use crate::config::CACHE_WRITE_BUFFER_BYTES;
use crate::error::FetchError;
use crate::source::traits::ByteStream;

/// Channel feeding an in-flight HTTP response body.
pub type Sink = mpsc::Sender<Result<Bytes, FetchError>>;

/// Stream `body` into `target`, copying every chunk to `sink` as it arrives.
///
/// Bytes go to `<target>.tmp` and are renamed onto `target` only after the
/// whole body was received, flushed and synced. The two destinations fail
/// independently: a disconnected sink never stops the cache write, and a
/// failed cache write never stops delivery to the sink. A sink that accepts
/// nothing for `sink_stall` is detached, so a requester that stops reading
/// cannot hold up the download.
///
/// Returns the number of bytes received from the origin.
pub async fn tee_to_cache(
    mut body: ByteStream,
    expected_len: Option<u64>,
    mut sink: Option<Sink>,
    sink_stall: Duration,
    target: &Path,
) -> Result<u64, FetchError> {
    let temp = temp_path_for(target);
    let mut cache_error = None;
    let mut writer = match create_temp(&temp).await {
        Ok(file) => Some(BufWriter::with_capacity(CACHE_WRITE_BUFFER_BYTES, file)),
        Err(e) => {
            warn!("cannot create {}: {}", temp.display(), e);
            cache_error = Some(e);
            None
        }
    };

    let mut received = 0u64;
    while let Some(next) = body.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    "origin stream failed for {} after {} bytes: {}",
                    target.display(),
                    received,
                    e
                );
                fail_sink(sink.take(), e.clone()).await;
                drop(writer);
                discard_temp(&temp).await;
                return Err(e);
            }
        };
        received += chunk.len() as u64;

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_all(&chunk).await {
                warn!("cache write to {} failed: {}", temp.display(), e);
                cache_error = Some(FetchError::cache_io("write", e));
                writer = None;
                discard_temp(&temp).await;
            }
        }

        if let Some(s) = sink.as_ref() {
            match tokio::time::timeout(sink_stall, s.send(Ok(chunk))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(
                        "requester for {} disconnected at {} bytes, continuing download",
                        target.display(),
                        received
                    );
                    sink = None;
                }
                Err(_) => {
                    warn!(
                        "requester for {} stalled for {:?} at {} bytes, detaching it",
                        target.display(),
                        sink_stall,
                        received
                    );
                    sink = None;
                }
            }
        }

        if writer.is_none() && sink.is_none() {
            break;
        }
    }

    if let Some(expected) = expected_len {
        if received != expected && cache_error.is_none() {
            let e = FetchError::Transport(format!(
                "origin body ended after {} of {} bytes",
                received, expected
            ));
            warn!("{} for {}", e, target.display());
            fail_sink(sink.take(), e.clone()).await;
            drop(writer);
            discard_temp(&temp).await;
            return Err(e);
        }
    }

    // The requester has everything; end its response before publishing.
    drop(sink);

    if let Some(e) = cache_error {
        return Err(e);
    }
    let Some(writer) = writer else {
        return Err(FetchError::CacheWrite("temp file unavailable".to_string()));
    };

    if let Err(e) = publish(writer, &temp, target).await {
        warn!("publishing {} failed: {}", target.display(), e);
        discard_temp(&temp).await;
        return Err(e);
    }

    debug!("published {} ({} bytes)", target.display(), received);
    Ok(received)
}

async fn create_temp(temp: &Path) -> Result<File, FetchError> {
    if let Some(parent) = temp.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::cache_io("create cache dir", e))?;
    }
    File::create(temp)
        .await
        .map_err(|e| FetchError::cache_io("create temp file", e))
}

async fn publish(mut writer: BufWriter<File>, temp: &Path, target: &Path) -> Result<(), FetchError> {
    writer
        .flush()
        .await
        .map_err(|e| FetchError::cache_io("flush", e))?;
    let file = writer.into_inner();
    file.sync_all()
        .await
        .map_err(|e| FetchError::cache_io("sync", e))?;
    drop(file);
    tokio::fs::rename(temp, target)
        .await
        .map_err(|e| FetchError::cache_io("rename", e))
}

async fn fail_sink(sink: Option<Sink>, err: FetchError) {
    if let Some(sink) = sink {
        let _ = sink.send(Err(err)).await;
    }
}

async fn discard_temp(temp: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", temp.display(), e);
        }
    }
}
