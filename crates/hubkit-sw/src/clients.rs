//! Pages (clients) the worker can control.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use hubkit_net::Origin;
use url::Url;

use crate::ServiceWorkerError;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
}

/// A client (open page or worker).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether this worker controls the client.
    pub controlled: bool,
}

impl Client {
    /// An uncontrolled window at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<(), ServiceWorkerError> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        Ok(())
    }
}

// ==================== Clients ====================

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Window clients, optionally including ones this worker does not control.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        let mut clients: Vec<_> = self
            .clients
            .values()
            .filter(|c| c.client_type == ClientType::Window)
            .filter(|c| include_uncontrolled || c.controlled)
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Take control of every uncontrolled window of `origin`. Returns how many were claimed.
    pub fn claim(&mut self, origin: &Origin) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.client_type == ClientType::Window
                && !client.controlled
                && origin.contains(&client.url)
            {
                client.controlled = true;
                claimed += 1;
            }
        }
        claimed
    }

    /// Open a new focused, controlled window.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client {
            focused: true,
            controlled: true,
            ..Client::window(url)
        };
        self.add(client.clone());
        client
    }

    /// Focus the first window showing exactly `url`.
    pub fn focus_url(&mut self, url: &Url) -> Option<Client> {
        let id = self
            .match_all(true)
            .into_iter()
            .find(|c| &c.url == url)
            .map(|c| c.id.clone())?;

        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
