use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use kiln_resource::ResourceId;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::record_store::CompiledResourceDb;
use crate::request::{CompilationRequest, RequestId, RequestOrigin};
use crate::server_context::ResourceServerContext;
use crate::worker::ResourceServerWorker;
use crate::Error;

/// Notification published on the server's event bus.
#[derive(Debug, Clone)]
pub enum ResourceServerEvent {
    /// A request entered the queue.
    RequestQueued {
        /// Id assigned to the request.
        request_id: RequestId,
        /// The requested resource.
        resource_id: ResourceId,
    },
    /// A request reached a terminal status.
    RequestCompleted {
        /// The finished request, including status, log and timing.
        request: Arc<CompilationRequest>,
    },
}

/// The resource compilation server.
///
/// Owns the request queue, a fixed pool of workers, the shared record store
/// and the event bus. Requests for a resource that is already in flight
/// coalesce onto the running request - for a given resource id at most one
/// worker is ever active.
pub struct ResourceServer {
    context: Arc<ResourceServerContext>,
    db: Arc<CompiledResourceDb>,
    queue_tx: mpsc::UnboundedSender<CompilationRequest>,
    active: Arc<Mutex<HashMap<ResourceId, RequestId>>>,
    events: broadcast::Sender<ResourceServerEvent>,
    workers: Vec<JoinHandle<()>>,
    next_request_id: AtomicU64,
}

impl ResourceServer {
    pub(crate) fn start(
        context: Arc<ResourceServerContext>,
        db: Arc<CompiledResourceDb>,
        worker_count: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (events, _) = broadcast::channel(256);
        let active = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..worker_count.max(1))
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    context.clone(),
                    db.clone(),
                    queue_rx.clone(),
                    active.clone(),
                    events.clone(),
                ))
            })
            .collect();

        info!("resource server started with {} workers", worker_count.max(1));
        Self {
            context,
            db,
            queue_tx,
            active,
            events,
            workers,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// The shared server context.
    pub fn context(&self) -> &Arc<ResourceServerContext> {
        &self.context
    }

    /// The shared record store.
    pub fn record_db(&self) -> &Arc<CompiledResourceDb> {
        &self.db
    }

    /// Subscribes to the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceServerEvent> {
        self.events.subscribe()
    }

    /// Queues a compilation request for `resource_id`.
    ///
    /// If a request for the same resource is already in flight the
    /// submission coalesces and the in-flight request id is returned.
    pub async fn submit(
        &self,
        resource_id: ResourceId,
        origin: RequestOrigin,
    ) -> Result<RequestId, Error> {
        self.enqueue(resource_id, origin, false).await
    }

    /// Queues a request that compiles even when the resource is up to date.
    pub async fn submit_forced(
        &self,
        resource_id: ResourceId,
        origin: RequestOrigin,
    ) -> Result<RequestId, Error> {
        self.enqueue(resource_id, origin, true).await
    }

    async fn enqueue(
        &self,
        resource_id: ResourceId,
        origin: RequestOrigin,
        forced: bool,
    ) -> Result<RequestId, Error> {
        if self.context.is_exiting() {
            return Err(Error::Exiting);
        }

        let mut active = self.active.lock().await;
        if let Some(&in_flight) = active.get(&resource_id) {
            return Ok(in_flight);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut request =
            CompilationRequest::new(request_id, resource_id.clone(), origin, &self.context);
        if forced {
            request.set_forced();
        }

        active.insert(resource_id.clone(), request_id);
        if self.queue_tx.send(request).is_err() {
            active.remove(&resource_id);
            return Err(Error::Exiting);
        }
        drop(active);

        let _ = self.events.send(ResourceServerEvent::RequestQueued {
            request_id,
            resource_id,
        });
        Ok(request_id)
    }

    /// Shuts the server down.
    ///
    /// Sets the exit flag, stops scheduling and drains in-flight work -
    /// running compiler processes are allowed to complete, there is no
    /// forced kill. Requests still queued at this point are abandoned.
    pub async fn shutdown(self) {
        let Self {
            context,
            db,
            queue_tx,
            workers,
            ..
        } = self;

        context.begin_exit();
        drop(queue_tx);
        join_all(workers).await;
        db.close().await;
        info!("resource server stopped");
    }
}

async fn worker_loop(
    index: usize,
    context: Arc<ResourceServerContext>,
    db: Arc<CompiledResourceDb>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<CompilationRequest>>>,
    active: Arc<Mutex<HashMap<ResourceId, RequestId>>>,
    events: broadcast::Sender<ResourceServerEvent>,
) {
    let worker = ResourceServerWorker::new(context.clone(), db);
    loop {
        // Hold the queue lock only for the dequeue itself.
        let request = { queue.lock().await.recv().await };
        let mut request = match request {
            Some(request) => request,
            None => break,
        };

        if context.is_exiting() {
            // Abandoned: never processed, no completion event.
            active.lock().await.remove(&request.resource_id);
            continue;
        }

        worker.process(&mut request).await;

        active.lock().await.remove(&request.resource_id);
        let _ = events.send(ResourceServerEvent::RequestCompleted {
            request: Arc::new(request),
        });
    }
    info!("resource server worker {} stopped", index);
}

#[cfg(test)]
#[path = "test_up_to_date.rs"]
mod test_up_to_date;

#[cfg(test)]
#[path = "test_compile.rs"]
mod test_compile;
