use std::sync::Arc;

use futures_util::StreamExt;
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, EngineError, EngineEvent, EventFilter};
use crate::output::Sink;
use crate::target::{Target, TargetFilter};

/// Streams every target that should be tailed, exactly once per lifecycle
/// instance: the current containers first, then whatever the engine's event
/// stream brings in. Subscribing before enumerating closes the gap where a
/// container starts between the two steps; the filter deduplicates the
/// overlap. The channel closes on cancellation or when the subscription
/// fails.
pub async fn watch_targets(
    engine: Arc<dyn ContainerEngine>,
    filter: Arc<TargetFilter>,
    labels: Vec<String>,
    err_out: Sink,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Target>, EngineError> {
    let mut events = engine
        .events(&EventFilter {
            labels: labels.clone(),
        })
        .await?;
    // Stopped containers are included: their last run may still hold logs
    // inside the requested window.
    let ids = engine.list_containers(&labels).await?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        for id in ids {
            if !visit_container(&engine, &filter, &id, &tx, &err_out).await {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.next() => match event {
                    Some(Ok(EngineEvent::Start { id })) => {
                        debug!("container started: {id}");
                        if !visit_container(&engine, &filter, &id, &tx, &err_out).await {
                            return;
                        }
                    }
                    Some(Ok(EngineEvent::Die { id })) => filter.inactive(&id),
                    Some(Ok(EngineEvent::Destroy { id })) => filter.forget(&id),
                    Some(Err(e)) => {
                        err_out.write_line(&format!("event subscription failed: {e}"));
                        return;
                    }
                    None => return,
                },
            }
        }
    });
    Ok(rx)
}

/// Inspects one container and pushes every target the filter accepts.
/// Returns false once the receiver is gone.
async fn visit_container(
    engine: &Arc<dyn ContainerEngine>,
    filter: &TargetFilter,
    id: &str,
    tx: &mpsc::Sender<Target>,
    err_out: &Sink,
) -> bool {
    let record = match engine.inspect_container(id).await {
        Ok(record) => record,
        Err(e) => {
            err_out.write_line(&format!("failed to inspect container id={id}: {e}"));
            return true;
        }
    };
    let mut found = Vec::new();
    filter.visit(&record, |t| found.push(t));
    for target in found {
        if tx.send(target).await.is_err() {
            return false;
        }
    }
    true
}
