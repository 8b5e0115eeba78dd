//! REST 401 handling against an in-process axum API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use base64::Engine;
use pos_client::api::UserRole;
use pos_client::store::StockMovement;
use pos_client::{
    ApiError, ClientConfig, CredentialStore, HttpApi, LoadState, ProductStore, SessionStatus, TableApi, TableStore,
};
use serde_json::{json, Value};

struct FakeApi {
    valid_token: Mutex<String>,
    refresh_ok: AtomicBool,
    table_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    stock_bodies: Mutex<Vec<(String, Value)>>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn tables(State(api): State<Arc<FakeApi>>, headers: HeaderMap) -> Response {
    api.table_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers).as_deref() != Some(api.valid_token.lock().unwrap().as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([{"id": "1", "number": 1, "name": "Patio", "isOccupied": false}])).into_response()
}

async fn refresh(State(api): State<Arc<FakeApi>>) -> Response {
    api.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if !api.refresh_ok.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let fresh = "fresh-token".to_string();
    *api.valid_token.lock().unwrap() = fresh.clone();
    Json(json!({"accessToken": fresh})).into_response()
}

async fn products() -> Response {
    Json(json!([
        {"id": "p1", "name": "Agua", "price": 1.5, "stock": 10, "category": "Bebidas"},
        {"id": "p2", "name": "Flan", "price": 4.0, "stock": 3}
    ]))
    .into_response()
}

async fn product_stock(State(api): State<Arc<FakeApi>>, Path(id): Path<String>, Json(body): Json<Value>) -> Response {
    api.stock_bodies.lock().unwrap().push((id.clone(), body.clone()));
    let delta = body["quantity"].as_i64().unwrap_or(0);
    let stock = if body["type"] == "add" { 10 + delta } else { 10 - delta };
    Json(json!({"id": id, "name": "Agua", "price": 1.5, "stock": stock, "category": "Bebidas"})).into_response()
}

/// `waiter` logs in with a token-only response; everyone else gets a user.
async fn login(Json(body): Json<Value>) -> Response {
    if body["username"] == "waiter" {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let claims = engine.encode(r#"{"sub":"u9","name":"Lucia","role":"customer"}"#);
        return Json(json!({"accessToken": format!("h.{claims}.s")})).into_response();
    }
    Json(json!({
        "access_token": "login-token",
        "user": {"id": "u1", "fullName": "Admin", "role": "admin"}
    }))
    .into_response()
}

async fn spawn_api(valid: &str, refresh_ok: bool) -> (String, Arc<FakeApi>) {
    let api = Arc::new(FakeApi {
        valid_token: Mutex::new(valid.to_string()),
        refresh_ok: AtomicBool::new(refresh_ok),
        table_calls: AtomicUsize::new(0),
        refresh_calls: AtomicUsize::new(0),
        stock_bodies: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/api/tables", get(tables))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/login", post(login))
        .route("/api/products", get(products))
        .route("/api/products/{id}/stock", patch(product_stock))
        .with_state(Arc::clone(&api));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api"), api)
}

fn jwt(exp_offset_secs: i64) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = engine.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
    format!("{header}.{claims}.sig")
}

fn client(base: &str, credentials: &CredentialStore) -> HttpApi {
    HttpApi::new(&ClientConfig::new("ws://127.0.0.1:9/ws", base), credentials.clone()).unwrap()
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_request_replayed_once() {
    let (base, fake) = spawn_api("not-yet-issued", true).await;
    let credentials = CredentialStore::with_token(jwt(-60));
    let http = client(&base, &credentials);

    let tables = http.get_tables().await.unwrap();

    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name, "Patio");
    assert_eq!(credentials.token().as_deref(), Some("fresh-token"));
    assert_eq!(fake.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake.table_calls.load(Ordering::SeqCst), 2);
    assert_eq!(*credentials.status().borrow(), SessionStatus::Authenticated);
}

#[tokio::test]
async fn test_failed_refresh_expires_session() {
    let (base, fake) = spawn_api("not-yet-issued", false).await;
    let credentials = CredentialStore::with_token(jwt(-60));
    let status = credentials.status();
    let http = client(&base, &credentials);

    let err = http.get_tables().await.unwrap_err();

    assert!(matches!(err, ApiError::SessionExpired));
    assert_eq!(credentials.token(), None);
    assert_eq!(*status.borrow(), SessionStatus::Expired);
    assert_eq!(fake.table_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fake.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unexpired_token_skips_refresh_and_retries_once() {
    let (base, fake) = spawn_api("something-else", true).await;
    let token = jwt(3600);
    let credentials = CredentialStore::with_token(token.clone());
    let http = client(&base, &credentials);

    let err = http.get_tables().await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(fake.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fake.table_calls.load(Ordering::SeqCst), 2);
    assert_eq!(credentials.token(), Some(token));
    assert_eq!(*credentials.status().borrow(), SessionStatus::Authenticated);
}

#[tokio::test]
async fn test_login_then_store_load() {
    let (base, fake) = spawn_api("login-token", true).await;
    let credentials = CredentialStore::new();
    let http = Arc::new(client(&base, &credentials));

    let login = http.login("admin", "secret").await.unwrap();
    assert_eq!(login.token, "login-token");
    assert_eq!(login.user.full_name, "Admin");
    assert_eq!(credentials.token().as_deref(), Some("login-token"));

    let store = TableStore::new(http.clone());
    store.fetch_tables().await.unwrap();
    assert_eq!(store.tables().len(), 1);
    assert_eq!(store.load_state(), LoadState::Idle);
    assert_eq!(fake.table_calls.load(Ordering::SeqCst), 1);

    http.logout();
    let err = store.fetch_tables().await.unwrap_err();
    assert!(matches!(err, ApiError::SessionExpired));
    assert!(matches!(store.load_state(), LoadState::Error(_)));
}

#[tokio::test]
async fn test_login_without_user_reads_token_claims() {
    let (base, _fake) = spawn_api("unused", true).await;
    let credentials = CredentialStore::new();
    let http = client(&base, &credentials);

    let login = http.login("waiter", "secret").await.unwrap();

    assert_eq!(login.user.id, "u9");
    assert_eq!(login.user.full_name, "Lucia");
    assert_eq!(login.user.role, UserRole::Customer);
    assert_eq!(credentials.token(), Some(login.token));
}

#[tokio::test]
async fn test_product_load_and_stock_change() {
    let (base, fake) = spawn_api("unused", true).await;
    let http = Arc::new(client(&base, &CredentialStore::new()));
    let store = ProductStore::new(http);

    store.fetch_products().await.unwrap();
    assert_eq!(store.products().len(), 2);
    assert_eq!(store.categories(), vec!["Bebidas"]);

    store.update_stock("p1", 4, StockMovement::Remove).await.unwrap();
    assert_eq!(store.product_by_id("p1").unwrap().stock, 6);
    assert_eq!(
        *fake.stock_bodies.lock().unwrap(),
        vec![("p1".to_string(), json!({"quantity": 4, "type": "remove"}))]
    );
}
