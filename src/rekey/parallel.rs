/*
 * Copyright 2019-2021 Wren Powell
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The parallel rekey strategy: a fixed worker pool draining batches from a bounded channel.
//!
//! This is the async translation of a goroutine/channel/`WaitGroup` worker pool: a producer
//! splits the preloaded records into contiguous batches and feeds a bounded
//! [`tokio::sync::mpsc`] channel of capacity `2 * worker_count`; each worker drains that channel
//! from behind a shared `tokio::sync::Mutex`, reports a `BatchResult` on a fan-in result channel,
//! and the first worker to see a real failure cancels the shared token. The result channel
//! closing (every worker's sender dropped) is end-of-stream for the aggregator.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoProvider;
use crate::identity::PasswordIdentityStore;
use crate::record::{Record, RecordRepository};
use crate::Error;

use super::{cancelled, process_one, Candidates, RekeyAborted, RekeyEngine};

struct BatchResult {
    committed: i64,
    error: Option<Error>,
}

pub(super) async fn run(
    engine: &RekeyEngine,
    records: Vec<Record>,
    old_password: &[u8],
    new_password: &[u8],
    cancel: CancellationToken,
) -> Candidates {
    let worker_count = engine.worker_count().max(1);
    let batch_size = engine.batch_size().max(1);
    let batches: Vec<Vec<Record>> = records.chunks(batch_size).map(|c| c.to_vec()).collect();

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Record>>(2 * worker_count);
    let batch_rx = Arc::new(AsyncMutex::new(batch_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<BatchResult>(worker_count);

    let producer_cancel = cancel.clone();
    let producer = tokio::spawn(async move {
        for batch in batches {
            tokio::select! {
                _ = producer_cancel.cancelled() => break,
                send_result = batch_tx.send(batch) => {
                    if send_result.is_err() {
                        break;
                    }
                }
            }
        }
        // `batch_tx` drops here, closing the channel so workers see `recv() == None`.
    });

    let old_password: Arc<[u8]> = Arc::from(old_password);
    let new_password: Arc<[u8]> = Arc::from(new_password);

    let mut workers = JoinSet::new();
    for _ in 0..worker_count {
        let batch_rx = Arc::clone(&batch_rx);
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        let records_repo: Arc<dyn RecordRepository> = Arc::clone(engine.records_repo());
        let crypto: Arc<dyn CryptoProvider> = Arc::clone(engine.crypto_provider());
        let identity: Option<Arc<PasswordIdentityStore>> = engine.identity_store().clone();
        let old_password = Arc::clone(&old_password);
        let new_password = Arc::clone(&new_password);

        workers.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let batch = {
                    let mut rx = batch_rx.lock().await;
                    rx.recv().await
                };
                let batch = match batch {
                    Some(batch) => batch,
                    None => break,
                };

                let mut committed = 0i64;
                let mut failure = None;
                for record in &batch {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match process_one(
                        records_repo.as_ref(),
                        &crypto,
                        identity.as_deref(),
                        record,
                        &old_password,
                        &new_password,
                    )
                    .await
                    {
                        Ok(true) => committed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }

                let failed = failure.is_some();
                if result_tx.send(BatchResult { committed, error: failure }).await.is_err() {
                    break;
                }
                if failed {
                    cancel.cancel();
                    break;
                }
            }
        });
    }
    // Drop our own handle so the result channel closes once every worker's clone is dropped.
    drop(result_tx);

    let mut committed_total = 0i64;
    let mut failure: Option<Error> = None;
    while let Some(result) = result_rx.recv().await {
        committed_total += result.committed;
        if let Some(e) = result.error {
            if failure.is_none() {
                failure = Some(e);
            }
            cancel.cancel();
        }
    }

    let _ = producer.await;
    while workers.join_next().await.is_some() {}

    if let Some(source) = failure {
        return Err(RekeyAborted {
            committed: committed_total,
            source,
        });
    }
    if cancel.is_cancelled() {
        return Err(cancelled(committed_total));
    }
    Ok(committed_total)
}
