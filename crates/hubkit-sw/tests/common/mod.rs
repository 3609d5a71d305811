//! In-process origin for worker tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::StatusCode;
use hubkit_idb::IDBFactory;
use hubkit_net::{Fetcher, NetError, Request, Response};
use hubkit_sw::{IdbPendingStore, ServiceWorker, WorkerConfig, WorkerEnv, WorkerEvent};
use tokio::sync::{mpsc, Notify};
use url::Url;

pub const ORIGIN: &str = "https://hub.example";

#[derive(Clone)]
enum Behavior {
    Respond(Response),
    Offline,
    /// Wait for the gate, then respond.
    Gated(Arc<Notify>, Response),
}

/// Fetcher answering by URL path. Unknown paths are unreachable.
#[derive(Default)]
pub struct MockOrigin {
    routes: Mutex<HashMap<String, Behavior>>,
    requests: Mutex<Vec<Request>>,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, path: &str, behavior: Behavior) {
        self.routes.lock().unwrap().insert(path.to_string(), behavior);
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        let response = Response::new(StatusCode::from_u16(status).unwrap()).with_body(body.to_string());
        self.set(path, Behavior::Respond(response));
    }

    pub fn json(&self, path: &str, body: &str) {
        let response = Response::synthetic(StatusCode::OK, "application/json", body.to_string());
        self.set(path, Behavior::Respond(response));
    }

    pub fn respond_with(&self, path: &str, response: Response) {
        self.set(path, Behavior::Respond(response));
    }

    pub fn offline(&self, path: &str) {
        self.set(path, Behavior::Offline);
    }

    /// Respond with `body` only after the returned gate is notified.
    pub fn gate(&self, path: &str, body: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let response = Response::synthetic(StatusCode::OK, "application/json", body.to_string());
        self.set(path, Behavior::Gated(gate.clone(), response));
        gate
    }

    pub fn calls(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockOrigin {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.clone();
        let behavior = self.routes.lock().unwrap().get(url.path()).cloned();
        self.requests.lock().unwrap().push(request);

        match behavior {
            Some(Behavior::Respond(response)) => Ok(response.with_url(url)),
            Some(Behavior::Gated(gate, response)) => {
                gate.notified().await;
                Ok(response.with_url(url))
            }
            Some(Behavior::Offline) | None => {
                Err(NetError::Offline(format!("{} unreachable", url)))
            }
        }
    }
}

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
    Request::get(url(path))
}

/// Config for the mock origin with an empty manifest.
pub fn bare_config() -> WorkerConfig {
    WorkerConfig {
        manifest: Vec::new(),
        ..WorkerConfig::for_origin(ORIGIN)
    }
}

pub async fn memory_env(origin: &Arc<MockOrigin>) -> WorkerEnv {
    let store = IdbPendingStore::open(IDBFactory::new()).await.unwrap();
    WorkerEnv::new(origin.clone(), Arc::new(store))
}

/// An activated worker over an in-memory queue.
pub async fn active_worker(
    origin: &Arc<MockOrigin>,
    config: WorkerConfig,
) -> (ServiceWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
    let env = memory_env(origin).await;
    let (sw, rx) = ServiceWorker::new(config, env).unwrap();
    sw.install().await.unwrap();
    sw.activate().await.unwrap();
    (sw, rx)
}

pub fn events(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
