//! REST collaborator.
//!
//! The stores only see the `*Api` traits, so tests swap in in-memory fakes.
//! [`HttpApi`] is the `reqwest` implementation: it attaches the bearer token
//! from the [`CredentialStore`] and, on a 401, refreshes the token once and
//! replays the original request exactly once. If the refresh fails the
//! session is over: the credential is cleared and
//! [`SessionStatus::Expired`](crate::auth::SessionStatus::Expired) is
//! published.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::auth::{decode_claims, token_expired, CredentialStore};
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::store::{
    CreatedCustomer, Customer, NewCustomer, NewOrder, NewProduct, NewSongRequest, NewTable, Order, Product,
    ProductUpdate, SongRequest, StockChange, Table, TableUpdate,
};
use crate::types::OrderStatus;

// ═══════════════════════════════════════════════════════════════
// Collaborator traits
// ═══════════════════════════════════════════════════════════════

#[async_trait]
pub trait TableApi: Send + Sync {
    async fn get_tables(&self) -> Result<Vec<Table>, ApiError>;
    async fn create_table(&self, table: &NewTable) -> Result<Table, ApiError>;
    /// The answer may carry only the changed fields.
    async fn update_table(&self, id: &str, update: &TableUpdate) -> Result<TableUpdate, ApiError>;
    async fn delete_table(&self, id: &str) -> Result<(), ApiError>;
    async fn get_customers_by_table(&self, table_id: &str) -> Result<Vec<Customer>, ApiError>;
    async fn create_customer(&self, customer: &NewCustomer) -> Result<CreatedCustomer, ApiError>;
    async fn delete_customer(&self, id: &str) -> Result<(), ApiError>;
}

#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn get_orders(&self) -> Result<Vec<Order>, ApiError>;
    async fn get_orders_by_table(&self, table_id: &str) -> Result<Vec<Order>, ApiError>;
    async fn create_order(&self, order: &NewOrder) -> Result<Order, ApiError>;
    async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ApiError>;
}

#[async_trait]
pub trait SongApi: Send + Sync {
    /// `table_id` of `"all"` returns every table's queue.
    async fn get_song_requests(&self, table_id: &str) -> Result<Vec<SongRequest>, ApiError>;
    async fn create_song_request(&self, request: &NewSongRequest) -> Result<SongRequest, ApiError>;
}

#[async_trait]
pub trait ProductApi: Send + Sync {
    async fn get_products(&self) -> Result<Vec<Product>, ApiError>;
    async fn create_product(&self, product: &NewProduct) -> Result<Product, ApiError>;
    async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<Product, ApiError>;
    async fn update_product_stock(&self, id: &str, change: &StockChange) -> Result<Product, ApiError>;
    async fn delete_product(&self, id: &str) -> Result<(), ApiError>;
}

// ═══════════════════════════════════════════════════════════════
// Auth payloads
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Customer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub id: String,
    pub full_name: String,
    pub role: UserRole,
}

/// Token response of `/auth/login` and `/auth/refresh`. Both spellings of
/// the token field are in use server-side.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default, rename = "accessToken")]
    access_token_camel: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
}

impl TokenResponse {
    fn token(&self) -> Option<&str> {
        self.access_token_camel
            .as_deref()
            .or(self.access_token.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub token: String,
    pub user: LoginUser,
}

impl LoginUser {
    /// Fallback when the login response carries no user: read it from the
    /// token's claims. Missing claims default to the login name and the
    /// admin role.
    fn from_token(token: &str, username: &str) -> Self {
        let claims = decode_claims(token).unwrap_or_default();
        let role = match claims.role.as_deref() {
            Some("customer") => UserRole::Customer,
            _ => UserRole::Admin,
        };
        Self {
            id: claims.sub.unwrap_or_else(|| "unknown".into()),
            full_name: claims.name.unwrap_or_else(|| username.to_string()),
            role,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════

pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
    credentials: CredentialStore,
}

struct Request<'a> {
    method: Method,
    path: &'a str,
    query: &'a [(&'a str, &'a str)],
    body: Option<JsonValue>,
}

impl<'a> Request<'a> {
    fn new(method: Method, path: &'a str) -> Self {
        Self {
            method,
            path,
            query: &[],
            body: None,
        }
    }

    fn query(mut self, query: &'a [(&'a str, &'a str)]) -> Self {
        self.query = query;
        self
    }

    fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))?);
        Ok(self)
    }
}

impl HttpApi {
    pub fn new(config: &ClientConfig, credentials: CredentialStore) -> Result<Self, ApiError> {
        // A trailing slash makes `join` append instead of replacing the last segment.
        let mut base = config.api_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| ApiError::Url(format!("{base}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Log in and store the token.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResult, ApiError> {
        let url = self.url("auth/login")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let response = check(response).await?;
        let body: TokenResponse = response.json().await?;
        let token = body
            .token()
            .ok_or_else(|| ApiError::Decode("no access token in login response".into()))?
            .to_string();
        let user = match body.user {
            Some(user) => user,
            None => LoginUser::from_token(&token, username),
        };
        self.credentials.set(token.clone());
        info!(user = %user.id, role = ?user.role, "logged in");
        Ok(LoginResult { token, user })
    }

    pub fn logout(&self) {
        self.credentials.clear();
    }

    /// Try to obtain a fresh token. A token whose `exp` has not passed is
    /// kept as is and counts as success.
    pub async fn refresh_token(&self) -> bool {
        let token = match self.credentials.token() {
            Some(t) => t,
            None => {
                debug!("no token to refresh");
                return false;
            }
        };
        if !token_expired(&token) {
            debug!("token still valid, not refreshing");
            return true;
        }

        let url = match self.url("auth/refresh") {
            Ok(u) => u,
            Err(e) => {
                warn!("refresh url: {e}");
                return false;
            }
        };
        let response = match self.client.post(url).bearer_auth(&token).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("token refresh request failed: {e}");
                return false;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "token refresh rejected");
            return false;
        }
        match response.json::<TokenResponse>().await {
            Ok(body) => match body.token() {
                Some(fresh) => {
                    self.credentials.set(fresh);
                    info!("token refreshed");
                    true
                }
                None => {
                    warn!("refresh response carried no token");
                    false
                }
            },
            Err(e) => {
                warn!("refresh response decode failed: {e}");
                false
            }
        }
    }

    // ── Internal ────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Url(format!("{path}: {e}")))
    }

    async fn send_once(&self, req: &Request<'_>) -> Result<reqwest::Response, ApiError> {
        let url = self.url(req.path)?;
        let mut builder = self.client.request(req.method.clone(), url);
        if !req.query.is_empty() {
            builder = builder.query(req.query);
        }
        if let Some(token) = self.credentials.token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        debug!(method = %req.method, path = req.path, "request");
        let response = builder.send().await?;
        debug!(status = %response.status(), path = req.path, "response");
        Ok(response)
    }

    /// Send with the 401 → refresh → replay-once policy.
    async fn execute(&self, req: Request<'_>) -> Result<reqwest::Response, ApiError> {
        let response = self.send_once(&req).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        info!(path = req.path, "401 received, refreshing token");
        if self.refresh_token().await {
            let retry = self.send_once(&req).await?;
            return check(retry).await;
        }

        self.credentials.expire();
        Err(ApiError::SessionExpired)
    }

    async fn fetch<T: DeserializeOwned>(&self, req: Request<'_>) -> Result<T, ApiError> {
        let response = self.execute(req).await?;
        Ok(response.json::<T>().await?)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status { status, body })
}

#[async_trait]
impl TableApi for HttpApi {
    async fn get_tables(&self) -> Result<Vec<Table>, ApiError> {
        self.fetch(Request::new(Method::GET, "tables")).await
    }

    async fn create_table(&self, table: &NewTable) -> Result<Table, ApiError> {
        self.fetch(Request::new(Method::POST, "tables").json(table)?).await
    }

    async fn update_table(&self, id: &str, update: &TableUpdate) -> Result<TableUpdate, ApiError> {
        let path = format!("tables/{id}");
        self.fetch(Request::new(Method::PUT, &path).json(update)?).await
    }

    async fn delete_table(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("tables/{id}");
        self.execute(Request::new(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn get_customers_by_table(&self, table_id: &str) -> Result<Vec<Customer>, ApiError> {
        let query = [("tableId", table_id)];
        self.fetch(Request::new(Method::GET, "customers").query(&query)).await
    }

    async fn create_customer(&self, customer: &NewCustomer) -> Result<CreatedCustomer, ApiError> {
        self.fetch(Request::new(Method::POST, "customers").json(customer)?).await
    }

    async fn delete_customer(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("customers/{id}");
        self.execute(Request::new(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[async_trait]
impl OrderApi for HttpApi {
    async fn get_orders(&self) -> Result<Vec<Order>, ApiError> {
        self.fetch(Request::new(Method::GET, "orders")).await
    }

    async fn get_orders_by_table(&self, table_id: &str) -> Result<Vec<Order>, ApiError> {
        let path = format!("orders/table/{table_id}");
        self.fetch(Request::new(Method::GET, &path)).await
    }

    async fn create_order(&self, order: &NewOrder) -> Result<Order, ApiError> {
        self.fetch(Request::new(Method::POST, "orders").json(order)?).await
    }

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ApiError> {
        let path = format!("orders/{id}/status");
        let body = serde_json::json!({ "status": status });
        self.fetch(Request::new(Method::PATCH, &path).json(&body)?).await
    }
}

#[async_trait]
impl SongApi for HttpApi {
    async fn get_song_requests(&self, table_id: &str) -> Result<Vec<SongRequest>, ApiError> {
        let path = format!("song-requests/table/{table_id}");
        self.fetch(Request::new(Method::GET, &path)).await
    }

    async fn create_song_request(&self, request: &NewSongRequest) -> Result<SongRequest, ApiError> {
        self.fetch(Request::new(Method::POST, "song-requests").json(request)?).await
    }
}

#[async_trait]
impl ProductApi for HttpApi {
    async fn get_products(&self) -> Result<Vec<Product>, ApiError> {
        self.fetch(Request::new(Method::GET, "products")).await
    }

    async fn create_product(&self, product: &NewProduct) -> Result<Product, ApiError> {
        self.fetch(Request::new(Method::POST, "products").json(product)?).await
    }

    async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<Product, ApiError> {
        let path = format!("products/{id}");
        self.fetch(Request::new(Method::PATCH, &path).json(update)?).await
    }

    async fn update_product_stock(&self, id: &str, change: &StockChange) -> Result<Product, ApiError> {
        let path = format!("products/{id}/stock");
        self.fetch(Request::new(Method::PATCH, &path).json(change)?).await
    }

    async fn delete_product(&self, id: &str) -> Result<(), ApiError> {
        let path = format!("products/{id}");
        self.execute(Request::new(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_spellings() {
        let camel: TokenResponse = serde_json::from_str(r#"{"accessToken":"a"}"#).unwrap();
        assert_eq!(camel.token(), Some("a"));
        let snake: TokenResponse = serde_json::from_str(r#"{"access_token":"b"}"#).unwrap();
        assert_eq!(snake.token(), Some("b"));
        let none: TokenResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(none.token(), None);
    }

    #[test]
    fn test_url_join_keeps_base_path() {
        let config = ClientConfig::new("ws://x", "http://pos.local:3000/api");
        let api = HttpApi::new(&config, CredentialStore::new()).unwrap();
        assert_eq!(api.url("tables").unwrap().as_str(), "http://pos.local:3000/api/tables");
        assert_eq!(api.url("/orders/table/4").unwrap().as_str(), "http://pos.local:3000/api/orders/table/4");
    }

    #[test]
    fn test_login_user_from_token_claims() {
        use base64::Engine;
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let claims = engine.encode(r#"{"sub":"u7","name":"Marta","role":"customer"}"#);
        let user = LoginUser::from_token(&format!("h.{claims}.s"), "marta");
        assert_eq!(user.id, "u7");
        assert_eq!(user.full_name, "Marta");
        assert_eq!(user.role, UserRole::Customer);

        let fallback = LoginUser::from_token("opaque-token", "admin");
        assert_eq!(fallback.id, "unknown");
        assert_eq!(fallback.full_name, "admin");
        assert_eq!(fallback.role, UserRole::Admin);
    }

    #[test]
    fn test_bad_base_url() {
        let config = ClientConfig::new("ws://x", "not a url");
        assert!(matches!(HttpApi::new(&config, CredentialStore::new()), Err(ApiError::Url(_))));
    }
}
