use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use tracing::debug;

use super::ClientId;

/// One completed exchange replayed to the model on later requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub request: String,
    pub response: String,
}

impl Turn {
    pub fn new(request: impl Into<String>, response: impl Into<String>) -> Self {
        Self { request: request.into(), response: response.into() }
    }
}

/// History as seen by one request, plus its arrival ticket.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub ticket: u64,
    pub turns: Vec<Turn>,
}

#[derive(Debug)]
struct ClientHistory {
    capacity: usize,
    next_ticket: u64,
    // Sorted by arrival ticket.
    turns: VecDeque<(u64, Turn)>,
}

impl ClientHistory {
    fn new(capacity: usize) -> Self {
        Self { capacity, next_ticket: 0, turns: VecDeque::with_capacity(capacity) }
    }

    fn resize(&mut self, capacity: usize) {
        if self.capacity == capacity {
            return;
        }
        let keep = self.turns.len().min(capacity);
        let mut resized = VecDeque::with_capacity(capacity);
        resized.extend(self.turns.drain(self.turns.len() - keep..));
        self.turns = resized;
        self.capacity = capacity;
    }

    fn push(&mut self, ticket: u64, turn: Turn) {
        let index = self.turns.partition_point(|(existing, _)| *existing < ticket);
        self.turns.insert(index, (ticket, turn));
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
    }
}

/// Per-client conversation memory shared by all request handlers.
#[derive(Debug, Default)]
pub struct ContextStore {
    clients: Mutex<HashMap<ClientId, ClientHistory>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the client's history, creating or resizing it to `capacity` first.
    ///
    /// Every call takes a fresh arrival ticket which must be handed back to
    /// [`ContextStore::append`].
    pub fn get_or_create(&self, client: &ClientId, capacity: usize) -> HistorySnapshot {
        let mut clients = self.clients.lock().unwrap_or_else(|poison| poison.into_inner());
        let history = clients.entry(client.clone()).or_insert_with(|| {
            debug!(client = %client, capacity, "created client context");
            ClientHistory::new(capacity)
        });
        if history.capacity != capacity {
            debug!(client = %client, from = history.capacity, to = capacity, "resized client context");
            history.resize(capacity);
        }
        let ticket = history.next_ticket;
        history.next_ticket += 1;
        HistorySnapshot {
            ticket,
            turns: history.turns.iter().map(|(_, turn)| turn.clone()).collect(),
        }
    }

    pub fn resize(&self, client: &ClientId, capacity: usize) {
        let mut clients = self.clients.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(history) = clients.get_mut(client) {
            history.resize(capacity);
        }
    }

    /// Record a completed turn, evicting the oldest turns beyond capacity.
    pub fn append(&self, client: &ClientId, ticket: u64, request: String, response: String) {
        let mut clients = self.clients.lock().unwrap_or_else(|poison| poison.into_inner());
        match clients.get_mut(client) {
            Some(history) => history.push(ticket, Turn { request, response }),
            None => debug!(client = %client, "dropping turn for unknown client context"),
        }
    }

    /// Current history of a client, oldest first.
    pub fn history(&self, client: &ClientId) -> Vec<Turn> {
        let clients = self.clients.lock().unwrap_or_else(|poison| poison.into_inner());
        clients
            .get(client)
            .map(|history| history.turns.iter().map(|(_, turn)| turn.clone()).collect())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|poison| poison.into_inner()).len()
    }
}
