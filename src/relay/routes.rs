//! HTTP routes served by the local mediator.
//!
//! Same contract as the public relay. State lives in a [`MediatorStore`]
//! shared across workers and is dropped when the mediator stops.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use actix_web::{HttpRequest, HttpResponse, web};

use super::{MESSAGE_ID_HEADER, RelayMessage};

type MailboxKey = (String, String, String);

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, Vec<String>>,
    committees: HashMap<String, Vec<String>>,
    completed: HashMap<String, Vec<String>>,
    /// (session, message_id) -> signature JSON
    signatures: HashMap<(String, String), String>,
    /// (session, recipient, message_id) -> pending messages
    mailboxes: HashMap<MailboxKey, Vec<RelayMessage>>,
    setup_messages: HashMap<(String, String), String>,
}

/// In-memory session state behind the mediator routes.
#[derive(Default)]
pub struct MediatorStore {
    state: Mutex<StoreState>,
}

fn merge(into: &mut Vec<String>, parties: Vec<String>) {
    for party in parties {
        if !into.contains(&party) {
            into.push(party);
        }
    }
}

impl MediatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Every mutation is a single map operation, so a poisoned guard
        // still holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, session_id: &str, parties: Vec<String>) {
        let mut state = self.lock();
        merge(
            state.sessions.entry(session_id.to_string()).or_default(),
            parties,
        );
    }

    pub fn participants(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn end_session(&self, session_id: &str) {
        let mut state = self.lock();
        state.sessions.remove(session_id);
        state.committees.remove(session_id);
        state.completed.remove(session_id);
        state
            .signatures
            .retain(|(session, _), _| session != session_id);
        state
            .mailboxes
            .retain(|(session, _, _), _| session != session_id);
        state
            .setup_messages
            .retain(|(session, _), _| session != session_id);
    }

    pub fn set_committee(&self, session_id: &str, committee: Vec<String>) {
        self.lock()
            .committees
            .insert(session_id.to_string(), committee);
    }

    pub fn committee(&self, session_id: &str) -> Option<Vec<String>> {
        self.lock().committees.get(session_id).cloned()
    }

    pub fn mark_complete(&self, session_id: &str, parties: Vec<String>) {
        let mut state = self.lock();
        merge(
            state.completed.entry(session_id.to_string()).or_default(),
            parties,
        );
    }

    pub fn completed(&self, session_id: &str) -> Option<Vec<String>> {
        self.lock().completed.get(session_id).cloned()
    }

    pub fn put_signature(&self, session_id: &str, message_id: &str, signature: String) {
        self.lock()
            .signatures
            .insert((session_id.to_string(), message_id.to_string()), signature);
    }

    pub fn signature(&self, session_id: &str, message_id: &str) -> Option<String> {
        self.lock()
            .signatures
            .get(&(session_id.to_string(), message_id.to_string()))
            .cloned()
    }

    /// Queue `message` once for each recipient.
    pub fn push_message(&self, session_id: &str, message_id: &str, message: RelayMessage) {
        let mut state = self.lock();
        for recipient in &message.to {
            let mailbox = state
                .mailboxes
                .entry((
                    session_id.to_string(),
                    recipient.clone(),
                    message_id.to_string(),
                ))
                .or_default();
            if !mailbox.iter().any(|m| m.hash == message.hash) {
                mailbox.push(message.clone());
            }
        }
    }

    pub fn messages(&self, session_id: &str, party: &str, message_id: &str) -> Vec<RelayMessage> {
        self.lock()
            .mailboxes
            .get(&(
                session_id.to_string(),
                party.to_string(),
                message_id.to_string(),
            ))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove one message from a mailbox. Returns whether it was present.
    pub fn acknowledge(&self, session_id: &str, party: &str, message_id: &str, hash: &str) -> bool {
        let mut state = self.lock();
        let key = (
            session_id.to_string(),
            party.to_string(),
            message_id.to_string(),
        );
        match state.mailboxes.get_mut(&key) {
            Some(mailbox) => {
                let before = mailbox.len();
                mailbox.retain(|m| m.hash != hash);
                mailbox.len() != before
            }
            None => false,
        }
    }

    pub fn put_setup_message(&self, session_id: &str, message_id: &str, payload: String) {
        self.lock()
            .setup_messages
            .insert((session_id.to_string(), message_id.to_string()), payload);
    }

    pub fn setup_message(&self, session_id: &str, message_id: &str) -> Option<String> {
        self.lock()
            .setup_messages
            .get(&(session_id.to_string(), message_id.to_string()))
            .cloned()
    }

    pub fn clear(&self) {
        *self.lock() = StoreState::default();
    }
}

/// Topic from the `message_id` header; empty when absent.
fn message_id(req: &HttpRequest) -> String {
    req.headers()
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn json_or_not_found<T: serde::Serialize>(value: Option<T>) -> HttpResponse {
    match value {
        Some(value) => HttpResponse::Ok().json(value),
        None => HttpResponse::NotFound().finish(),
    }
}

/// POST /{session_id}
pub async fn register(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    parties: web::Json<Vec<String>>,
) -> HttpResponse {
    tracing::debug!(session_id = %session_id, parties = ?parties, "Party registration");
    store.register(&session_id, parties.into_inner());
    HttpResponse::Created().finish()
}

/// GET /{session_id}
pub async fn participants(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    HttpResponse::Ok().json(store.participants(&session_id))
}

/// DELETE /{session_id}
pub async fn end_session(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    store.end_session(&session_id);
    tracing::debug!(session_id = %session_id, "Session ended");
    HttpResponse::Ok().finish()
}

/// POST /start/{session_id}
pub async fn start(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    committee: web::Json<Vec<String>>,
) -> HttpResponse {
    tracing::info!(session_id = %session_id, committee = ?committee, "Session started");
    store.set_committee(&session_id, committee.into_inner());
    HttpResponse::Ok().finish()
}

/// GET /start/{session_id}
pub async fn committee(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    json_or_not_found(store.committee(&session_id))
}

/// POST /complete/{session_id}
pub async fn mark_complete(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    parties: web::Json<Vec<String>>,
) -> HttpResponse {
    store.mark_complete(&session_id, parties.into_inner());
    HttpResponse::Ok().finish()
}

/// GET /complete/{session_id}
pub async fn completed(
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    json_or_not_found(store.completed(&session_id))
}

/// POST /complete/{session_id}/keysign
pub async fn publish_signature(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    body: String,
) -> HttpResponse {
    store.put_signature(&session_id, &message_id(&req), body);
    HttpResponse::Ok().finish()
}

/// GET /complete/{session_id}/keysign
pub async fn fetch_signature(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    match store.signature(&session_id, &message_id(&req)) {
        Some(body) => HttpResponse::Ok()
            .content_type("application/json")
            .body(body),
        None => HttpResponse::NotFound().finish(),
    }
}

/// POST /message/{session_id}
pub async fn post_message(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    message: web::Json<RelayMessage>,
) -> HttpResponse {
    store.push_message(&session_id, &message_id(&req), message.into_inner());
    HttpResponse::Accepted().finish()
}

/// GET /message/{session_id}/{party}
pub async fn get_messages(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (session_id, party) = path.into_inner();
    HttpResponse::Ok().json(store.messages(&session_id, &party, &message_id(&req)))
}

/// DELETE /message/{session_id}/{party}/{hash}
pub async fn delete_message(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    path: web::Path<(String, String, String)>,
) -> HttpResponse {
    let (session_id, party, hash) = path.into_inner();
    if !store.acknowledge(&session_id, &party, &message_id(&req), &hash) {
        tracing::debug!(session_id = %session_id, party = %party, hash = %hash, "Acknowledged unknown message");
    }
    HttpResponse::Ok().finish()
}

/// POST /setup-message/{session_id}
pub async fn post_setup_message(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
    body: String,
) -> HttpResponse {
    store.put_setup_message(&session_id, &message_id(&req), body);
    HttpResponse::Created().finish()
}

/// GET /setup-message/{session_id}
pub async fn get_setup_message(
    req: HttpRequest,
    store: web::Data<MediatorStore>,
    session_id: web::Path<String>,
) -> HttpResponse {
    match store.setup_message(&session_id, &message_id(&req)) {
        Some(body) => HttpResponse::Ok().body(body),
        None => HttpResponse::NotFound().finish(),
    }
}

/// GET /ping
pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().body("Mediator is running")
}

/// Configure mediator routes.
///
/// Fixed-prefix routes are registered before the catch-all `/{session_id}`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ping", web::get().to(ping))
        .route("/start/{session_id}", web::post().to(start))
        .route("/start/{session_id}", web::get().to(committee))
        .route(
            "/complete/{session_id}/keysign",
            web::post().to(publish_signature),
        )
        .route(
            "/complete/{session_id}/keysign",
            web::get().to(fetch_signature),
        )
        .route("/complete/{session_id}", web::post().to(mark_complete))
        .route("/complete/{session_id}", web::get().to(completed))
        .route("/message/{session_id}", web::post().to(post_message))
        .route("/message/{session_id}/{party}", web::get().to(get_messages))
        .route(
            "/message/{session_id}/{party}/{hash}",
            web::delete().to(delete_message),
        )
        .route(
            "/setup-message/{session_id}",
            web::post().to(post_setup_message),
        )
        .route(
            "/setup-message/{session_id}",
            web::get().to(get_setup_message),
        )
        .route("/{session_id}", web::post().to(register))
        .route("/{session_id}", web::get().to(participants))
        .route("/{session_id}", web::delete().to(end_session));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, http::StatusCode, test};

    fn message(hash: &str, to: &[&str]) -> RelayMessage {
        RelayMessage {
            session_id: "s1".to_string(),
            from: "a".to_string(),
            to: to.iter().map(|p| p.to_string()).collect(),
            body: "Ym9keQ==".to_string(),
            hash: hash.to_string(),
            sequence_no: 0,
        }
    }

    #[::core::prelude::v1::test]
    fn test_register_merges_parties() {
        let store = MediatorStore::new();
        store.register("s1", vec!["a".to_string()]);
        store.register("s1", vec!["b".to_string(), "a".to_string()]);
        assert_eq!(store.participants("s1"), vec!["a", "b"]);
        assert!(store.participants("other").is_empty());
    }

    #[::core::prelude::v1::test]
    fn test_messages_are_queued_per_recipient_and_topic() {
        let store = MediatorStore::new();
        store.push_message("s1", "m1", message("h1", &["b", "c"]));
        store.push_message("s1", "m1", message("h1", &["b"]));

        assert_eq!(store.messages("s1", "b", "m1").len(), 1);
        assert_eq!(store.messages("s1", "c", "m1").len(), 1);
        assert!(store.messages("s1", "b", "m2").is_empty());

        assert!(store.acknowledge("s1", "b", "m1", "h1"));
        assert!(!store.acknowledge("s1", "b", "m1", "h1"));
        assert!(store.messages("s1", "b", "m1").is_empty());
        assert_eq!(store.messages("s1", "c", "m1").len(), 1);
    }

    #[::core::prelude::v1::test]
    fn test_end_session_drops_everything() {
        let store = MediatorStore::new();
        store.register("s1", vec!["a".to_string()]);
        store.set_committee("s1", vec!["a".to_string()]);
        store.push_message("s1", "", message("h1", &["b"]));
        store.put_setup_message("s1", "", "setup".to_string());
        store.end_session("s1");

        assert!(store.participants("s1").is_empty());
        assert!(store.committee("s1").is_none());
        assert!(store.messages("s1", "b", "").is_empty());
        assert!(store.setup_message("s1", "").is_none());
    }

    #[actix_rt::test]
    async fn test_session_routes() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(MediatorStore::new()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/s1")
            .set_json(vec!["a"])
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::CREATED
        );

        let req = test::TestRequest::get().uri("/s1").to_request();
        let parties: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(parties, vec!["a"]);

        let req = test::TestRequest::get().uri("/start/s1").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::NOT_FOUND
        );

        let req = test::TestRequest::post()
            .uri("/start/s1")
            .set_json(vec!["a", "b"])
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::get().uri("/start/s1").to_request();
        let committee: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(committee, vec!["a", "b"]);
    }

    #[actix_rt::test]
    async fn test_message_routes_respect_topic_header() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(MediatorStore::new()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/message/s1")
            .insert_header((MESSAGE_ID_HEADER, "m1"))
            .set_json(message("h1", &["b"]))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::get()
            .uri("/message/s1/b")
            .insert_header((MESSAGE_ID_HEADER, "m1"))
            .to_request();
        let inbox: Vec<RelayMessage> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(inbox.len(), 1);

        let req = test::TestRequest::get().uri("/message/s1/b").to_request();
        let untagged: Vec<RelayMessage> = test::call_and_read_body_json(&app, req).await;
        assert!(untagged.is_empty());

        let req = test::TestRequest::delete()
            .uri("/message/s1/b/h1")
            .insert_header((MESSAGE_ID_HEADER, "m1"))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::get()
            .uri("/message/s1/b")
            .insert_header((MESSAGE_ID_HEADER, "m1"))
            .to_request();
        let inbox: Vec<RelayMessage> = test::call_and_read_body_json(&app, req).await;
        assert!(inbox.is_empty());
    }
}
