//! In-memory PDP provider

use super::chain::MockChain;
use super::lock;
use crate::chain::DatasetInfo;
use crate::error::{Result, StorageError};
use crate::idempotency::IDEMPOTENCY_HEADER;
use crate::pdp::{
    AddPiecesRequest, CreateDatasetRequest, CreateSessionRequest, FinalizeRequest,
};
use crate::transport::{Body, HttpRequest, HttpResponse, Method};
use crate::types::{DatasetId, Metadata, Phase, PieceCid, ProviderId};
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A failure to inject into the next request of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Answer with this status and no side effect
    Status(u16),
    /// Fail the connection before the request reaches the handler
    Refuse,
    /// Apply the request, then lose the response
    DropResponse,
}

enum Route<'a> {
    Ping,
    CreateDataset,
    DatasetStatus(&'a str),
    AddPieces(&'a str),
    CreateSession,
    PutBytes(&'a str),
    Finalize(&'a str),
    PieceStatus(&'a str),
    Download(&'a str),
}

impl Route<'_> {
    fn parse(method: Method, path: &str) -> Option<Route<'_>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match (method, segments.as_slice()) {
            (Method::Head, []) | (Method::Get, []) => Some(Route::Ping),
            (Method::Post, ["data-sets"]) => Some(Route::CreateDataset),
            (Method::Get, ["data-sets", "created", tx]) => Some(Route::DatasetStatus(*tx)),
            (Method::Post, ["data-sets", id, "pieces"]) => Some(Route::AddPieces(*id)),
            (Method::Post, ["sessions"]) => Some(Route::CreateSession),
            (Method::Put, ["sessions", id, "bytes"]) => Some(Route::PutBytes(*id)),
            (Method::Post, ["sessions", id, "finalize"]) => Some(Route::Finalize(*id)),
            (Method::Get, ["pieces", id, "status"]) => Some(Route::PieceStatus(*id)),
            (Method::Get, ["pieces", cid]) | (Method::Head, ["pieces", cid]) => {
                Some(Route::Download(*cid))
            }
            _ => None,
        }
    }

    fn phase(&self) -> Phase {
        match self {
            Route::Ping => Phase::Ping,
            Route::CreateDataset => Phase::CreateDataset,
            Route::DatasetStatus(_) => Phase::DatasetStatus,
            Route::AddPieces(_) => Phase::AddPieces,
            Route::CreateSession => Phase::CreateSession,
            Route::PutBytes(_) => Phase::PutBytes,
            Route::Finalize(_) => Phase::Finalize,
            Route::PieceStatus(_) => Phase::PollIndexed,
            Route::Download(_) => Phase::Download,
        }
    }
}

struct MockSession {
    dataset_id: DatasetId,
    size: u64,
    bytes: Option<Vec<u8>>,
    /// (piece CID, server piece id) once finalized
    finalized: Option<(String, String)>,
}

struct MockPiece {
    piece_cid: String,
    bytes: Vec<u8>,
    indexed_at: Instant,
}

#[derive(Default)]
struct ServerState {
    offline: bool,
    indexing_delay: Duration,
    failures: HashMap<Phase, VecDeque<MockFailure>>,
    calls: HashMap<Phase, usize>,
    next_id: u64,

    dataset_keys: HashMap<String, (Value, DatasetId)>,
    dataset_triples: HashMap<(String, u64), DatasetId>,
    created_tx: HashMap<String, DatasetId>,
    datasets_created: usize,
    dataset_pieces: HashMap<DatasetId, BTreeMap<String, Metadata>>,
    piece_keys: HashMap<String, (String, Metadata)>,
    batch_keys: HashMap<String, Value>,

    sessions: HashMap<String, MockSession>,
    session_keys: HashMap<String, (Value, String)>,
    pieces: HashMap<String, MockPiece>,
}

impl ServerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// One provider's PDP service, answering over a [`MockNetwork`](super::MockNetwork)
///
/// Idempotency follows the provider contract: a replayed key with the same
/// body gets a 409 naming the existing resource, a replayed key with a
/// different body gets a 422.
pub struct MockPdpServer {
    provider_id: ProviderId,
    endpoint: String,
    chain: Arc<MockChain>,
    state: Mutex<ServerState>,
}

impl MockPdpServer {
    pub fn new(
        provider_id: ProviderId,
        endpoint: impl Into<String>,
        chain: Arc<MockChain>,
    ) -> Self {
        Self {
            provider_id,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            chain,
            state: Mutex::new(ServerState::default()),
        }
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Refuse every connection while offline
    pub fn set_online(&self, online: bool) {
        lock(&self.state).offline = !online;
    }

    /// Delay between finalize and the piece reporting as indexed
    pub fn set_indexing_delay(&self, delay: Duration) {
        lock(&self.state).indexing_delay = delay;
    }

    pub fn fail_next(&self, phase: Phase, failure: MockFailure) {
        self.fail_times(phase, failure, 1);
    }

    pub fn fail_times(&self, phase: Phase, failure: MockFailure, times: usize) {
        let mut state = lock(&self.state);
        let queue = state.failures.entry(phase).or_default();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    /// Requests received for `phase`, including failed ones
    pub fn calls(&self, phase: Phase) -> usize {
        lock(&self.state).calls.get(&phase).copied().unwrap_or(0)
    }

    pub fn datasets_created(&self) -> usize {
        lock(&self.state).datasets_created
    }

    pub fn sessions_created(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    /// Piece CIDs registered in a dataset
    pub fn dataset_pieces(&self, dataset_id: DatasetId) -> Vec<String> {
        lock(&self.state)
            .dataset_pieces
            .get(&dataset_id)
            .map(|pieces| pieces.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make `bytes` downloadable under `piece_cid` without an upload
    pub fn store_piece(&self, piece_cid: &PieceCid, bytes: Vec<u8>) {
        let mut state = lock(&self.state);
        let piece_id = format!("piece-{}", state.next_id());
        state.pieces.insert(
            piece_id,
            MockPiece {
                piece_cid: piece_cid.to_string(),
                bytes,
                indexed_at: Instant::now(),
            },
        );
    }

    pub(crate) fn serves(&self, url: &str) -> bool {
        url.strip_prefix(&self.endpoint)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    pub(crate) fn handle(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let path = request.url.strip_prefix(&self.endpoint).unwrap_or_default();
        let Some(route) = Route::parse(request.method, path) else {
            return Ok(HttpResponse::new(404).with_json(json!({"message": "no such route"})));
        };
        let phase = route.phase();

        let mut state = lock(&self.state);
        if state.offline {
            return Err(StorageError::network(format!(
                "connection refused by {}",
                self.endpoint
            )));
        }
        *state.calls.entry(phase).or_default() += 1;

        let failure = state.failures.get_mut(&phase).and_then(VecDeque::pop_front);
        match failure {
            Some(MockFailure::Status(status)) => {
                debug!("{} injecting HTTP {} for {}", self.endpoint, status, phase);
                Ok(HttpResponse::new(status).with_json(json!({"message": "injected failure"})))
            }
            Some(MockFailure::Refuse) => Err(StorageError::network(format!(
                "connection reset by {}",
                self.endpoint
            ))),
            Some(MockFailure::DropResponse) => {
                let applied = self.dispatch(&mut state, route, request);
                debug!(
                    "{} dropping response to {} (status {})",
                    self.endpoint,
                    phase,
                    applied.status
                );
                Err(StorageError::network("connection closed before response"))
            }
            None => Ok(self.dispatch(&mut state, route, request)),
        }
    }

    fn dispatch(
        &self,
        state: &mut ServerState,
        route: Route<'_>,
        request: &HttpRequest,
    ) -> HttpResponse {
        let key = request.header_value(IDEMPOTENCY_HEADER).map(str::to_string);
        match route {
            Route::Ping => HttpResponse::new(200),
            Route::CreateDataset => self.create_dataset(state, key, &request.body),
            Route::DatasetStatus(tx) => match state.created_tx.get(tx) {
                Some(id) => HttpResponse::new(200)
                    .with_json(json!({"dataSetCreated": true, "dataSetId": id})),
                None => not_found("unknown transaction"),
            },
            Route::AddPieces(id) => match id.parse() {
                Ok(dataset_id) => self.add_pieces(state, dataset_id, key, &request.body),
                Err(_) => bad_request("invalid dataset id"),
            },
            Route::CreateSession => self.create_session(state, key, &request.body),
            Route::PutBytes(id) => put_bytes(state, id, &request.body),
            Route::Finalize(id) => self.finalize(state, id, &request.body),
            Route::PieceStatus(id) => match state.pieces.get(id) {
                Some(piece) => HttpResponse::new(200)
                    .with_json(json!({"indexed": Instant::now() >= piece.indexed_at})),
                None => not_found("unknown piece"),
            },
            Route::Download(cid) => match state.pieces.values().find(|p| p.piece_cid == cid) {
                Some(piece) => HttpResponse::new(200).with_body(piece.bytes.clone()),
                None => not_found("piece not stored here"),
            },
        }
    }

    fn create_dataset(
        &self,
        state: &mut ServerState,
        key: Option<String>,
        body: &Body,
    ) -> HttpResponse {
        let (raw, request) = match parse_json::<CreateDatasetRequest>(body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let Some(key) = key else {
            return bad_request("missing idempotency key");
        };

        if let Some((seen, dataset_id)) = state.dataset_keys.get(&key) {
            return if *seen == raw {
                conflict(json!({
                    "existingDataSetId": dataset_id,
                    "message": "dataset exists for key"
                }))
            } else {
                unprocessable("idempotency key reused with a different payload")
            };
        }

        let triple = (request.payer.clone(), request.client_data_set_id);
        if let Some(dataset_id) = state.dataset_triples.get(&triple) {
            return conflict(json!({
                "existingDataSetId": dataset_id,
                "message": "client dataset id already in use"
            }));
        }

        let dataset_id = self.chain.allocate_dataset_id();
        let tx_hash = format!("0x{:064x}", state.next_id());
        state.dataset_keys.insert(key, (raw, dataset_id));
        state.dataset_triples.insert(triple, dataset_id);
        state.created_tx.insert(tx_hash.clone(), dataset_id);
        state.dataset_pieces.insert(dataset_id, BTreeMap::new());
        state.datasets_created += 1;

        self.chain.register_dataset(
            DatasetInfo {
                dataset_id,
                provider_id: self.provider_id,
                client_dataset_id: request.client_data_set_id,
                payer: request.payer,
                live: true,
                active_piece_count: 0,
            },
            request.metadata,
        );

        HttpResponse::new(201)
            .with_header("Location", format!("/data-sets/created/{}", tx_hash))
            .with_json(json!({"txHash": tx_hash}))
    }

    fn add_pieces(
        &self,
        state: &mut ServerState,
        dataset_id: DatasetId,
        key: Option<String>,
        body: &Body,
    ) -> HttpResponse {
        let (raw, request) = match parse_json::<AddPiecesRequest>(body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        if !state.dataset_pieces.contains_key(&dataset_id) {
            return not_found("unknown dataset");
        }
        if let Some(seen) = key.as_ref().and_then(|k| state.batch_keys.get(k)) {
            if *seen != raw {
                return unprocessable("batch key reused with a different payload");
            }
        }
        for entry in &request.pieces {
            if let Some((cid, metadata)) = state.piece_keys.get(entry.idempotency_key.as_str()) {
                if cid != entry.piece_cid.as_str() || *metadata != entry.metadata {
                    return unprocessable("piece key reused with a different payload");
                }
            }
        }

        let stored = state.dataset_pieces.entry(dataset_id).or_default();
        let existing: Vec<String> = request
            .pieces
            .iter()
            .map(|entry| entry.piece_cid.to_string())
            .filter(|cid| stored.contains_key(cid))
            .collect();
        if !existing.is_empty() {
            return conflict(json!({
                "existingPieces": existing,
                "message": "pieces already in dataset"
            }));
        }

        for entry in &request.pieces {
            stored.insert(entry.piece_cid.to_string(), entry.metadata.clone());
        }
        for entry in &request.pieces {
            state.piece_keys.insert(
                entry.idempotency_key.to_string(),
                (entry.piece_cid.to_string(), entry.metadata.clone()),
            );
        }
        if let Some(key) = key {
            state.batch_keys.insert(key, raw);
        }
        self.chain
            .record_pieces(dataset_id, request.pieces.len() as u64);

        let tx_hash = format!("0x{:064x}", state.next_id());
        HttpResponse::new(201).with_json(json!({"txHash": tx_hash}))
    }

    fn create_session(
        &self,
        state: &mut ServerState,
        key: Option<String>,
        body: &Body,
    ) -> HttpResponse {
        let (raw, request) = match parse_json::<CreateSessionRequest>(body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        if !state.dataset_pieces.contains_key(&request.data_set_id) {
            return not_found("unknown dataset");
        }
        let key = key.unwrap_or_else(|| request.idempotency_key.to_string());

        if let Some((seen, session_id)) = state.session_keys.get(&key) {
            return if *seen == raw {
                conflict(json!({
                    "existingSessionId": session_id,
                    "message": "session exists for key"
                }))
            } else {
                unprocessable("idempotency key reused with a different payload")
            };
        }

        let session_id = format!("session-{}", state.next_id());
        state.sessions.insert(
            session_id.clone(),
            MockSession {
                dataset_id: request.data_set_id,
                size: request.size,
                bytes: None,
                finalized: None,
            },
        );
        state.session_keys.insert(key, (raw, session_id.clone()));

        HttpResponse::new(201)
            .with_header("Location", format!("/sessions/{}", session_id))
            .with_json(json!({"sessionId": session_id}))
    }

    fn finalize(&self, state: &mut ServerState, session_id: &str, body: &Body) -> HttpResponse {
        let (_, request) = match parse_json::<FinalizeRequest>(body) {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let piece_id = format!("piece-{}", state.next_id());
        let delay = state.indexing_delay;

        let Some(session) = state.sessions.get_mut(session_id) else {
            return not_found("unknown session");
        };
        if let Some((cid, existing)) = &session.finalized {
            return if cid == request.piece_cid.as_str() {
                conflict(json!({
                    "existingPieceId": existing,
                    "message": "session already finalized"
                }))
            } else {
                unprocessable("session finalized under a different piece CID")
            };
        }
        let Some(bytes) = session.bytes.clone() else {
            return bad_request("no bytes uploaded for session");
        };

        session.finalized = Some((request.piece_cid.to_string(), piece_id.clone()));
        debug!(
            "Session {} for dataset {} finalized as {}",
            session_id, session.dataset_id, piece_id
        );
        state.pieces.insert(
            piece_id.clone(),
            MockPiece {
                piece_cid: request.piece_cid.to_string(),
                bytes,
                indexed_at: Instant::now() + delay,
            },
        );
        HttpResponse::new(200).with_json(json!({"pieceId": piece_id}))
    }
}

fn put_bytes(state: &mut ServerState, session_id: &str, body: &Body) -> HttpResponse {
    let Some(session) = state.sessions.get_mut(session_id) else {
        return not_found("unknown session");
    };
    let Body::Bytes(bytes) = body else {
        return bad_request("expected raw bytes");
    };

    if let Some(stored) = &session.bytes {
        return if stored == bytes {
            conflict(json!({
                "existingSessionId": session_id,
                "message": "bytes already received"
            }))
        } else {
            unprocessable("session already holds different bytes")
        };
    }
    if bytes.len() as u64 != session.size {
        return bad_request("payload size does not match the declared size");
    }

    session.bytes = Some(bytes.clone());
    HttpResponse::new(204)
}

fn parse_json<T: DeserializeOwned>(
    body: &Body,
) -> std::result::Result<(Value, T), HttpResponse> {
    let Body::Json(raw) = body else {
        return Err(bad_request("expected a JSON body"));
    };
    serde_json::from_value(raw.clone())
        .map(|parsed| (raw.clone(), parsed))
        .map_err(|e| bad_request(&format!("malformed body: {}", e)))
}

fn conflict(body: Value) -> HttpResponse {
    HttpResponse::new(409).with_json(body)
}

fn unprocessable(message: &str) -> HttpResponse {
    HttpResponse::new(422).with_json(json!({ "message": message }))
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::new(400).with_json(json!({ "message": message }))
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::new(404).with_json(json!({ "message": message }))
}
