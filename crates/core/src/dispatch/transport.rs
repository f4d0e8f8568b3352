//! In-process message transport shared by several named endpoints.
//!
//! Each endpoint registers a queue on the [`MessageBus`] under its name, and a
//! request is delivered to the queue of the endpoint it is addressed to, so an
//! endpoint never sees messages meant for another one. Requests without a
//! target go to the bus's default endpoint. Each [`Connection`] owns a private
//! reply channel and a table of callers waiting on their request id.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use super::envelope::{DispatchRequest, DispatchResponse, JobType};
use crate::{LipSyncError, Result};

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<DispatchResponse>>>>;

/// A request in flight together with the way its answer goes back.
#[derive(Debug)]
struct Routed {
    request: DispatchRequest,
    responder: Responder,
}

/// Delivers exactly one reply. If it is dropped unanswered, for example when
/// the endpoint stops with the request still queued, the caller gets an error
/// envelope instead.
#[derive(Debug)]
struct Responder {
    request_id: String,
    reply_to: Option<mpsc::UnboundedSender<DispatchResponse>>,
}

impl Responder {
    fn respond(mut self, response: DispatchResponse) {
        if let Some(reply_to) = self.reply_to.take() {
            let _ = reply_to.send(response);
        }
    }

    /// Used when delivery failed and the caller is told directly.
    fn disarm(mut self) {
        self.reply_to = None;
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(reply_to) = self.reply_to.take() {
            let _ = reply_to.send(DispatchResponse::error(
                self.request_id.clone(),
                "endpoint stopped before answering the request",
            ));
        }
    }
}

#[derive(Debug, Default)]
struct EndpointTable {
    queues: BTreeMap<String, mpsc::Sender<Routed>>,
    default: Option<String>,
}

/// Transport connecting callers to named endpoints.
#[derive(Debug, Clone)]
pub struct MessageBus {
    capacity: usize,
    endpoints: Arc<Mutex<EndpointTable>>,
}

impl MessageBus {
    /// `capacity` bounds each endpoint's queue. Senders wait for room rather
    /// than dropping requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            endpoints: Arc::new(Mutex::new(EndpointTable::default())),
        }
    }

    /// Opens a connection whose requests are addressed to `target`.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, target: Option<String>) -> Connection {
        Connection::new(self.clone(), target)
    }

    /// Names of the endpoints currently registered.
    pub fn endpoints(&self) -> Vec<String> {
        self.lock()
            .map(|table| table.queues.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Endpoint answering requests that carry no target. The first endpoint
    /// registered takes this role unless another one is chosen.
    pub fn default_endpoint(&self) -> Option<String> {
        self.lock().ok().and_then(|table| table.default.clone())
    }

    pub fn set_default_endpoint(&self, name: &str) -> Result<()> {
        let mut table = self.lock()?;
        if !table.queues.contains_key(name) {
            return Err(LipSyncError::Dispatch(format!("no endpoint named `{name}` on the message bus")));
        }
        table.default = Some(name.to_string());
        Ok(())
    }

    fn register(&self, name: &str) -> Result<mpsc::Receiver<Routed>> {
        let mut table = self.lock()?;
        if table.queues.contains_key(name) {
            return Err(LipSyncError::Dispatch(format!(
                "endpoint `{name}` is already registered on the message bus"
            )));
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        table.queues.insert(name.to_string(), sender);
        if table.default.is_none() {
            table.default = Some(name.to_string());
        }
        Ok(receiver)
    }

    fn unregister(&self, name: &str) {
        if let Ok(mut table) = self.lock() {
            table.queues.remove(name);
            if table.default.as_deref() == Some(name) {
                table.default = table.queues.keys().next().cloned();
            }
        }
    }

    fn route(&self, target: Option<&str>) -> Result<(String, mpsc::Sender<Routed>)> {
        let table = self.lock()?;
        let name = match target {
            Some(name) => name,
            None => table.default.as_deref().ok_or_else(|| {
                LipSyncError::Dispatch("no endpoint is listening on the message bus".to_string())
            })?,
        };
        table
            .queues
            .get(name)
            .map(|queue| (name.to_string(), queue.clone()))
            .ok_or_else(|| LipSyncError::Dispatch(format!("no endpoint named `{name}` on the message bus")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, EndpointTable>> {
        self.endpoints
            .lock()
            .map_err(|_| LipSyncError::msg("endpoint table has been poisoned"))
    }
}

/// Client side of the transport.
pub struct Connection {
    bus: MessageBus,
    target: Option<String>,
    reply_tx: mpsc::UnboundedSender<DispatchResponse>,
    pending: PendingReplies,
    reader: JoinHandle<()>,
}

impl Connection {
    fn new(bus: MessageBus, target: Option<String>) -> Self {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<DispatchResponse>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        let waiting = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(response) = reply_rx.recv().await {
                let caller = waiting
                    .lock()
                    .ok()
                    .and_then(|mut table| table.remove(&response.request_id));
                match caller {
                    // The caller may have stopped waiting; nothing to do then.
                    Some(caller) => {
                        let _ = caller.send(response);
                    }
                    None => tracing::debug!(
                        request_id = %response.request_id,
                        "dropping reply with no waiting caller"
                    ),
                }
            }
        });

        Self {
            bus,
            target,
            reply_tx,
            pending,
            reader,
        }
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Number of requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.lock_pending().map(|table| table.len()).unwrap_or(0)
    }

    /// Sends a request built from the parts and waits for its reply.
    pub async fn call(
        &self,
        job_type: JobType,
        data: Value,
        attachments: Vec<Bytes>,
    ) -> Result<DispatchResponse> {
        let mut request = DispatchRequest::new(job_type, data).with_target(self.target.clone());
        request.attachments = attachments;
        self.send(request).await
    }

    /// Sends `request` to the endpoint it names and waits for the reply
    /// carrying its id. Error envelopes are returned as responses, not as
    /// `Err`.
    pub async fn send(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        let (endpoint, queue) = self.bus.route(request.target.as_deref())?;
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.lock_pending()?;
            if table.contains_key(&request_id) {
                return Err(LipSyncError::Dispatch(format!(
                    "request id `{request_id}` is already in flight"
                )));
            }
            table.insert(request_id.clone(), tx);
        }

        let _entry = PendingEntry {
            connection: self,
            request_id: &request_id,
        };

        let routed = Routed {
            request,
            responder: Responder {
                request_id: request_id.clone(),
                reply_to: Some(self.reply_tx.clone()),
            },
        };
        if let Err(mpsc::error::SendError(routed)) = queue.send(routed).await {
            routed.responder.disarm();
            return Err(LipSyncError::Dispatch(format!("endpoint `{endpoint}` has stopped")));
        }

        tracing::trace!(request_id = %request_id, %endpoint, "request sent");
        rx.await.map_err(|_| {
            LipSyncError::Dispatch(format!("connection closed before `{request_id}` was answered"))
        })
    }

    fn forget(&self, request_id: &str) {
        if let Ok(mut table) = self.lock_pending() {
            table.remove(request_id);
        }
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, HashMap<String, oneshot::Sender<DispatchResponse>>>> {
        self.pending
            .lock()
            .map_err(|_| LipSyncError::msg("pending reply table has been poisoned"))
    }
}

/// Removes a caller from the pending table when it stops waiting.
struct PendingEntry<'a> {
    connection: &'a Connection,
    request_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.connection.forget(self.request_id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Server side: turns a request into exactly one response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: DispatchRequest) -> DispatchResponse;
}

/// Whether an endpoint finishes one request before taking the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    #[default]
    Serial,
    Concurrent,
}

/// Running endpoint. Dropping the handle stops it.
#[derive(Debug)]
pub struct EndpointHandle {
    name: String,
    task: Option<JoinHandle<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl EndpointHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting requests. Callers still waiting on this endpoint get
    /// an error reply.
    pub fn shutdown(mut self) {
        if let Some(signal) = self.shutdown.take() {
            let _ = signal.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // The worker thread exits on its own once the signal arrives.
        drop(self.thread.take());
    }
}

/// Spawns an endpoint called `name` as a task on the current runtime.
pub fn spawn_endpoint(
    bus: &MessageBus,
    name: impl Into<String>,
    handler: Arc<dyn RequestHandler>,
    mode: ProcessingMode,
) -> Result<EndpointHandle> {
    let name = name.into();
    let queue = bus.register(&name)?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(serve(bus.clone(), queue, name.clone(), handler, mode, shutdown_rx));

    Ok(EndpointHandle {
        name,
        task: Some(task),
        thread: None,
        shutdown: Some(shutdown_tx),
    })
}

/// Spawns an endpoint on its own OS thread with a single-threaded runtime,
/// so its jobs never compete with the caller's executor.
pub fn spawn_dedicated_worker(
    bus: &MessageBus,
    name: impl Into<String>,
    handler: Arc<dyn RequestHandler>,
) -> Result<EndpointHandle> {
    let name = name.into();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let queue = bus.register(&name)?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let worker_bus = bus.clone();
    let worker_name = name.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("lipsync-{name}"))
        .spawn(move || {
            runtime.block_on(serve(
                worker_bus,
                queue,
                worker_name,
                handler,
                ProcessingMode::Serial,
                shutdown_rx,
            ));
        });
    let thread = match spawned {
        Ok(thread) => thread,
        Err(err) => {
            bus.unregister(&name);
            return Err(err.into());
        }
    };

    Ok(EndpointHandle {
        name,
        task: None,
        thread: Some(thread),
        shutdown: Some(shutdown_tx),
    })
}

async fn serve(
    bus: MessageBus,
    mut queue: mpsc::Receiver<Routed>,
    name: String,
    handler: Arc<dyn RequestHandler>,
    mode: ProcessingMode,
    mut shutdown: oneshot::Receiver<()>,
) {
    let _registration = Registration { bus, name: name.clone() };
    tracing::debug!(endpoint = %name, ?mode, "endpoint listening");
    loop {
        let Routed { request, responder } = tokio::select! {
            _ = &mut shutdown => break,
            received = queue.recv() => match received {
                Some(routed) => routed,
                None => break,
            },
        };

        match mode {
            ProcessingMode::Serial => responder.respond(answer(&handler, request).await),
            ProcessingMode::Concurrent => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    responder.respond(answer(&handler, request).await);
                });
            }
        }
    }
    // Requests still queued are answered with an error as `queue` drops.
    tracing::debug!(endpoint = %name, "endpoint stopped");
}

/// Removes an endpoint from the bus however its task ends.
struct Registration {
    bus: MessageBus,
    name: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.bus.unregister(&self.name);
    }
}

/// Runs the handler in its own task so a panic becomes an error reply
/// instead of taking the endpoint down.
async fn answer(handler: &Arc<dyn RequestHandler>, request: DispatchRequest) -> DispatchResponse {
    let request_id = request.request_id.clone();
    let handler = Arc::clone(handler);
    match tokio::spawn(async move { handler.handle(request).await }).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(request_id = %request_id, %err, "request handler failed");
            DispatchResponse::error(request_id, format!("request handler failed: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde_json::json;

    use super::*;

    /// Echoes the request data after sleeping for `data.delayMs`.
    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: DispatchRequest) -> DispatchResponse {
            let delay = request.data["delayMs"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            DispatchResponse::success(
                request.request_id,
                request.data,
                request.attachments,
            )
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Counting {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RequestHandler for Counting {
        async fn handle(&self, request: DispatchRequest) -> DispatchResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DispatchResponse::success(request.request_id, Value::Null, Vec::new())
        }
    }

    struct Panicking;

    #[async_trait]
    impl RequestHandler for Panicking {
        async fn handle(&self, _request: DispatchRequest) -> DispatchResponse {
            panic!("converter crashed");
        }
    }

    #[tokio::test]
    async fn concurrent_requests_are_matched_by_id() {
        let bus = MessageBus::new(16);
        let _endpoint = spawn_endpoint(&bus, "worker", Arc::new(Echo), ProcessingMode::Concurrent).unwrap();
        let connection = bus.connect(Some("worker".to_string()));

        let slow = DispatchRequest::new(JobType::GenerateMotion, json!({ "delayMs": 80, "n": 1 }));
        let fast = DispatchRequest::new(JobType::GenerateMotion, json!({ "delayMs": 0, "n": 2 }));
        let (slow_id, fast_id) = (slow.request_id.clone(), fast.request_id.clone());

        let (slow_reply, fast_reply) = tokio::join!(connection.send(slow), connection.send(fast));
        let (slow_reply, fast_reply) = (slow_reply.unwrap(), fast_reply.unwrap());

        assert_eq!(slow_reply.request_id, slow_id);
        assert_eq!(slow_reply.data.unwrap()["n"], 1);
        assert_eq!(fast_reply.request_id, fast_id);
        assert_eq!(fast_reply.data.unwrap()["n"], 2);
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn messages_for_unknown_endpoints_never_reach_others() {
        let bus = MessageBus::new(16);
        let counter = Arc::new(Counting::default());
        let _endpoint = spawn_endpoint(&bus, "worker", counter.clone(), ProcessingMode::Serial).unwrap();
        let stranger = bus.connect(Some("offscreen".to_string()));

        let err = stranger
            .call(JobType::Initialize, Value::Null, Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LipSyncError::Dispatch(_)));
        assert_eq!(counter.calls(), 0);
        assert_eq!(stranger.in_flight(), 0);
    }

    #[tokio::test]
    async fn more_requests_than_queue_capacity_are_all_answered() {
        let bus = MessageBus::new(2);
        let _endpoint = spawn_endpoint(&bus, "worker", Arc::new(Echo), ProcessingMode::Serial).unwrap();
        let connection = Arc::new(bus.connect(Some("worker".to_string())));

        let calls = (0..8).map(|n| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_secs(2),
                    connection.call(JobType::GenerateMotion, json!({ "delayMs": 30, "n": n }), Vec::new()),
                )
                .await
            })
        });

        let mut answered = Vec::new();
        for call in calls.collect::<Vec<_>>() {
            let reply = call.await.unwrap().expect("request was never answered").unwrap();
            answered.push(reply.data.unwrap()["n"].as_u64().unwrap());
        }
        answered.sort_unstable();
        assert_eq!(answered, (0..8).collect::<Vec<_>>());
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn untargeted_requests_are_handled_once() {
        let bus = MessageBus::new(16);
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let _a = spawn_endpoint(&bus, "worker", first.clone(), ProcessingMode::Serial).unwrap();
        let _b = spawn_endpoint(&bus, "offscreen", second.clone(), ProcessingMode::Serial).unwrap();
        assert_eq!(bus.default_endpoint().as_deref(), Some("worker"));

        let connection = bus.connect(None);
        let reply = connection
            .call(JobType::Initialize, Value::Null, Vec::new())
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(first.calls() + second.calls(), 1);

        bus.set_default_endpoint("offscreen").unwrap();
        connection
            .call(JobType::Initialize, Value::Null, Vec::new())
            .await
            .unwrap();
        assert_eq!((first.calls(), second.calls()), (1, 1));
    }

    #[tokio::test]
    async fn panicking_handler_answers_with_an_error() {
        let bus = MessageBus::new(16);
        let _endpoint = spawn_endpoint(&bus, "worker", Arc::new(Panicking), ProcessingMode::Serial).unwrap();
        let connection = bus.connect(Some("worker".to_string()));

        for _ in 0..2 {
            let reply = tokio::time::timeout(
                Duration::from_secs(2),
                connection.call(JobType::ConvertMotion, Value::Null, Vec::new()),
            )
            .await
            .expect("caller was left waiting")
            .unwrap();
            assert!(!reply.is_success());
            assert!(reply.error.unwrap().contains("panicked"));
        }
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn stopping_an_endpoint_fails_queued_callers() {
        let bus = MessageBus::new(16);
        let endpoint = spawn_endpoint(&bus, "worker", Arc::new(Echo), ProcessingMode::Serial).unwrap();
        let connection = Arc::new(bus.connect(Some("worker".to_string())));

        let waiting = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .call(JobType::GenerateMotion, json!({ "delayMs": 500 }), Vec::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint.shutdown();

        let reply = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("caller was left waiting")
            .unwrap()
            .unwrap();
        assert!(!reply.is_success());
        assert!(bus.endpoints().is_empty());
    }

    #[tokio::test]
    async fn attachments_travel_with_the_envelope() {
        let bus = MessageBus::new(16);
        let _endpoint = spawn_endpoint(&bus, "worker", Arc::new(Echo), ProcessingMode::Serial).unwrap();
        let connection = bus.connect(Some("worker".to_string()));

        let reply = connection
            .call(JobType::ConvertMotion, json!({}), vec![Bytes::from_static(b"vmd")])
            .await
            .unwrap();
        assert_eq!(reply.attachments, vec![Bytes::from_static(b"vmd")]);
    }

    #[tokio::test]
    async fn sending_without_listeners_fails() {
        let bus = MessageBus::new(4);
        let connection = bus.connect(None);

        let err = connection
            .call(JobType::Initialize, Value::Null, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LipSyncError::Dispatch(_)));
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn dedicated_worker_serves_from_its_own_thread() {
        let bus = MessageBus::new(16);
        let endpoint = spawn_dedicated_worker(&bus, "dedicated", Arc::new(Echo)).unwrap();
        let connection = bus.connect(Some("dedicated".to_string()));

        let reply = connection
            .call(JobType::Initialize, json!({ "ok": true }), Vec::new())
            .await
            .unwrap();
        assert!(reply.is_success());
        endpoint.shutdown();
    }
}
