//! Product catalogue. REST only: the server pushes no product events.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{lock, Collection, Entity, LoadState};
use crate::api::ProductApi;
use crate::error::ApiError;

/// Categories offered before the first load, and whenever no loaded
/// product names one.
pub const DEFAULT_CATEGORIES: [&str; 4] = ["Bebidas", "Comidas", "Postres", "Otros"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl Entity for Product {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub stock: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Partial product edit. Only `Some` fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockMovement {
    Add,
    Remove,
}

/// Body of `PATCH /products/{id}/stock`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StockChange {
    pub quantity: u32,
    #[serde(rename = "type")]
    pub movement: StockMovement,
}

#[derive(Debug)]
struct ProductState {
    products: Collection<Product>,
    categories: Vec<String>,
    load: LoadState,
}

impl Default for ProductState {
    fn default() -> Self {
        Self {
            products: Collection::default(),
            categories: default_categories(),
            load: LoadState::Idle,
        }
    }
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

/// Distinct non-empty categories in first-seen order, or the defaults.
fn derive_categories(products: &[Product]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for category in products.iter().filter_map(|p| p.category.as_deref()) {
        if !category.is_empty() && !seen.iter().any(|c| c == category) {
            seen.push(category.to_string());
        }
    }
    if seen.is_empty() {
        default_categories()
    } else {
        seen
    }
}

pub struct ProductStore {
    api: Arc<dyn ProductApi>,
    state: Mutex<ProductState>,
}

impl ProductStore {
    pub fn new(api: Arc<dyn ProductApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            state: Mutex::new(ProductState::default()),
        })
    }

    pub fn products(&self) -> Vec<Product> {
        lock(&self.state).products.items().to_vec()
    }

    pub fn product_by_id(&self, id: &str) -> Option<Product> {
        lock(&self.state).products.get(id).cloned()
    }

    pub fn products_by_category(&self, category: &str) -> Vec<Product> {
        lock(&self.state)
            .products
            .items()
            .iter()
            .filter(|p| p.category.as_deref() == Some(category))
            .cloned()
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        lock(&self.state).categories.clone()
    }

    pub fn load_state(&self) -> LoadState {
        lock(&self.state).load.clone()
    }

    // ── REST ────────────────────────────────────────────────

    /// Baseline load. Also rebuilds the category list.
    pub async fn fetch_products(&self) -> Result<(), ApiError> {
        self.begin();
        match self.api.get_products().await {
            Ok(products) => {
                let categories = derive_categories(&products);
                info!(count = products.len(), categories = categories.len(), "products loaded");
                let mut state = lock(&self.state);
                state.products.replace(products);
                state.categories = categories;
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to load products", e)),
        }
    }

    pub async fn add_product(&self, product: &NewProduct) -> Result<Product, ApiError> {
        self.begin();
        match self.api.create_product(product).await {
            Ok(created) => {
                let mut state = lock(&self.state);
                state.products.push(created.clone());
                state.load = LoadState::Idle;
                Ok(created)
            }
            Err(e) => Err(self.fail("failed to create product", e)),
        }
    }

    pub async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<(), ApiError> {
        let result = self.api.update_product(id, update);
        self.store_returned(id, "failed to update product", result).await
    }

    pub async fn remove_product(&self, id: &str) -> Result<(), ApiError> {
        self.begin();
        match self.api.delete_product(id).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                state.products.remove(id);
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail("failed to delete product", e)),
        }
    }

    /// Move stock server-side. The server decides the resulting level.
    pub async fn update_stock(&self, id: &str, quantity: u32, movement: StockMovement) -> Result<(), ApiError> {
        let change = StockChange { quantity, movement };
        let result = self.api.update_product_stock(id, &change);
        self.store_returned(id, "failed to update stock", result).await
    }

    // ── Internal ────────────────────────────────────────────

    /// Replace the local copy with the server's answer.
    async fn store_returned(
        &self,
        id: &str,
        what: &str,
        call: impl std::future::Future<Output = Result<Product, ApiError>>,
    ) -> Result<(), ApiError> {
        self.begin();
        match call.await {
            Ok(product) => {
                let mut state = lock(&self.state);
                state.products.patch(id, |p| *p = product);
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail(what, e)),
        }
    }

    fn begin(&self) {
        lock(&self.state).load = LoadState::Loading;
    }

    fn fail(&self, what: &str, err: ApiError) -> ApiError {
        warn!("{what}: {err}");
        lock(&self.state).load = LoadState::Error(format!("{what}: {err}"));
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeProducts {
        products: Mutex<Vec<Product>>,
        stock_calls: Mutex<Vec<(String, StockChange)>>,
    }

    impl FakeProducts {
        fn find(&self, id: &str) -> Result<Product, ApiError> {
            self.products
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or_else(|| ApiError::Status {
                    status: reqwest::StatusCode::NOT_FOUND,
                    body: String::new(),
                })
        }
    }

    #[async_trait]
    impl ProductApi for FakeProducts {
        async fn get_products(&self) -> Result<Vec<Product>, ApiError> {
            Ok(self.products.lock().unwrap().clone())
        }

        async fn create_product(&self, product: &NewProduct) -> Result<Product, ApiError> {
            Ok(Product {
                id: format!("p-{}", product.name.to_lowercase()),
                name: product.name.clone(),
                price: product.price,
                category: product.category.clone(),
                stock: product.stock,
                ..Default::default()
            })
        }

        async fn update_product(&self, id: &str, update: &ProductUpdate) -> Result<Product, ApiError> {
            let mut product = self.find(id)?;
            if let Some(price) = update.price {
                product.price = price;
            }
            Ok(product)
        }

        async fn update_product_stock(&self, id: &str, change: &StockChange) -> Result<Product, ApiError> {
            self.stock_calls.lock().unwrap().push((id.to_string(), *change));
            let mut product = self.find(id)?;
            product.stock = match change.movement {
                StockMovement::Add => product.stock + i64::from(change.quantity),
                StockMovement::Remove => product.stock - i64::from(change.quantity),
            };
            Ok(product)
        }

        async fn delete_product(&self, id: &str) -> Result<(), ApiError> {
            self.find(id).map(|_| ())
        }
    }

    fn product(id: &str, category: Option<&str>, stock: i64) -> Product {
        Product {
            id: id.into(),
            name: id.to_uppercase(),
            price: 2.5,
            category: category.map(str::to_string),
            stock,
            ..Default::default()
        }
    }

    fn store_with(products: Vec<Product>) -> (Arc<FakeProducts>, Arc<ProductStore>) {
        let api = Arc::new(FakeProducts::default());
        *api.products.lock().unwrap() = products;
        let store = ProductStore::new(api.clone());
        (api, store)
    }

    #[tokio::test]
    async fn test_categories_derived_in_first_seen_order() {
        let (_, store) = store_with(vec![
            product("cafe", Some("Bebidas"), 1),
            product("flan", Some("Postres"), 1),
            product("agua", Some("Bebidas"), 1),
            product("pan", None, 1),
            product("x", Some(""), 1),
        ]);
        store.fetch_products().await.unwrap();

        assert_eq!(store.categories(), vec!["Bebidas", "Postres"]);
        assert_eq!(store.products_by_category("Bebidas").len(), 2);
        assert_eq!(store.load_state(), LoadState::Idle);
    }

    #[tokio::test]
    async fn test_categories_fall_back_without_any() {
        let (api, store) = store_with(vec![product("cafe", Some("Cafés"), 1)]);
        assert_eq!(store.categories(), DEFAULT_CATEGORIES);

        store.fetch_products().await.unwrap();
        assert_eq!(store.categories(), vec!["Cafés"]);

        *api.products.lock().unwrap() = vec![product("pan", None, 1)];
        store.fetch_products().await.unwrap();
        assert_eq!(store.categories(), DEFAULT_CATEGORIES);
    }

    #[tokio::test]
    async fn test_update_stock_takes_server_copy() {
        let (api, store) = store_with(vec![product("cafe", Some("Bebidas"), 10)]);
        store.fetch_products().await.unwrap();

        store.update_stock("cafe", 4, StockMovement::Add).await.unwrap();
        assert_eq!(store.product_by_id("cafe").unwrap().stock, 14);

        // The fake keeps its own level, so the next answer starts from 10.
        store.update_stock("cafe", 3, StockMovement::Remove).await.unwrap();
        assert_eq!(store.product_by_id("cafe").unwrap().stock, 7);

        let calls = api.stock_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].1,
            StockChange {
                quantity: 3,
                movement: StockMovement::Remove
            }
        );

        assert!(store.update_stock("missing", 1, StockMovement::Add).await.is_err());
        assert!(store.load_state().error().is_some());
        assert_eq!(store.products().len(), 1);
    }

    #[tokio::test]
    async fn test_add_appends_and_server_refusals_keep_local_copy() {
        let (_, store) = store_with(vec![]);
        let created = store
            .add_product(&NewProduct {
                name: "Flan".into(),
                price: 4.0,
                category: Some("Postres".into()),
                stock: 6,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(created.id, "p-flan");
        assert_eq!(store.products().len(), 1);

        // The fake has no copy of it, so the edit is refused and the local
        // entity stays as it was.
        let update = ProductUpdate {
            price: Some(5.0),
            ..Default::default()
        };
        assert!(store.update_product("p-flan", &update).await.is_err());
        assert_eq!(store.product_by_id("p-flan").unwrap().price, 4.0);
        assert!(store.remove_product("p-flan").await.is_err());
        assert_eq!(store.products().len(), 1);
    }

    #[tokio::test]
    async fn test_update_product_replaces_local_copy() {
        let (_, store) = store_with(vec![product("cafe", Some("Bebidas"), 10)]);
        store.fetch_products().await.unwrap();

        let update = ProductUpdate {
            price: Some(3.0),
            ..Default::default()
        };
        store.update_product("cafe", &update).await.unwrap();
        assert_eq!(store.product_by_id("cafe").unwrap().price, 3.0);

        store.remove_product("cafe").await.unwrap();
        assert!(store.products().is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let raw = r#"{"id":"1","name":"Agua","price":1.5,"stock":12,"imageUrl":"a.png","isActive":true}"#;
        let parsed: Product = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.image_url.as_deref(), Some("a.png"));
        assert_eq!(parsed.is_active, Some(true));
        assert_eq!(parsed.category, None);

        let body = serde_json::to_value(StockChange {
            quantity: 2,
            movement: StockMovement::Remove,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"quantity": 2, "type": "remove"}));
    }
}
