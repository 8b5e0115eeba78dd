//! Song request queue. Loaded over REST only; the server pushes no song
//! events, so the queue is as fresh as the last fetch.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{lock, Collection, Entity, LoadState};
use crate::api::SongApi;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SongStatus {
    #[default]
    Pending,
    Playing,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub id: String,
    pub name: String,
    pub table_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub youtube_url: Option<String>,
    #[serde(default)]
    pub is_karaoke: bool,
    #[serde(default)]
    pub status: SongStatus,
    pub requested_by: Requester,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for SongRequest {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSongRequest {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
    pub is_karaoke: bool,
    pub requested_by: Requester,
}

#[derive(Debug, Default)]
struct SongState {
    requests: Collection<SongRequest>,
    load: LoadState,
}

pub struct SongStore {
    api: Arc<dyn SongApi>,
    state: Mutex<SongState>,
}

impl SongStore {
    pub fn new(api: Arc<dyn SongApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            state: Mutex::new(SongState::default()),
        })
    }

    pub fn song_requests(&self) -> Vec<SongRequest> {
        lock(&self.state).requests.items().to_vec()
    }

    pub fn load_state(&self) -> LoadState {
        lock(&self.state).load.clone()
    }

    /// Every table's queue.
    pub async fn fetch_song_requests(&self) -> Result<(), ApiError> {
        self.load("all").await
    }

    /// One table's queue. Replaces whatever was loaded before.
    pub async fn fetch_song_requests_by_table(&self, table_id: &str) -> Result<(), ApiError> {
        self.load(table_id).await
    }

    pub async fn add_song_request(&self, request: &NewSongRequest) -> Result<SongRequest, ApiError> {
        lock(&self.state).load = LoadState::Loading;
        match self.api.create_song_request(request).await {
            Ok(created) => {
                let mut state = lock(&self.state);
                state.requests.push(created.clone());
                state.load = LoadState::Idle;
                Ok(created)
            }
            Err(e) => Err(self.fail("failed to create song request", e)),
        }
    }

    async fn load(&self, scope: &str) -> Result<(), ApiError> {
        lock(&self.state).load = LoadState::Loading;
        match self.api.get_song_requests(scope).await {
            Ok(requests) => {
                info!(scope, count = requests.len(), "song requests loaded");
                let mut state = lock(&self.state);
                state.requests.replace(requests);
                state.load = LoadState::Idle;
                Ok(())
            }
            Err(e) => Err(self.fail(&format!("failed to load song requests ({scope})"), e)),
        }
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
    struct FakeSongs {
        scopes: Mutex<Vec<String>>,
    }

    fn song(id: &str, table: &str) -> SongRequest {
        SongRequest {
            id: id.into(),
            title: format!("song {id}"),
            artist: None,
            youtube_url: None,
            is_karaoke: false,
            status: SongStatus::Pending,
            requested_by: Requester {
                id: "c1".into(),
                name: "Ana".into(),
                table_id: table.into(),
            },
            created_at: None,
            updated_at: None,
        }
    }

    #[async_trait]
    impl SongApi for FakeSongs {
        async fn get_song_requests(&self, table_id: &str) -> Result<Vec<SongRequest>, ApiError> {
            self.scopes.lock().unwrap().push(table_id.to_string());
            match table_id {
                "all" => Ok(vec![song("1", "1"), song("2", "2")]),
                "down" => Err(ApiError::Decode("boom".into())),
                t => Ok(vec![song("3", t)]),
            }
        }

        async fn create_song_request(&self, request: &NewSongRequest) -> Result<SongRequest, ApiError> {
            let mut created = song("9", &request.requested_by.table_id);
            created.title = request.title.clone();
            Ok(created)
        }
    }

    #[tokio::test]
    async fn test_fetch_scopes_replace() {
        let api = Arc::new(FakeSongs::default());
        let store = SongStore::new(api.clone());

        store.fetch_song_requests().await.unwrap();
        assert_eq!(store.song_requests().len(), 2);

        store.fetch_song_requests_by_table("7").await.unwrap();
        let queue = store.song_requests();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].requested_by.table_id, "7");

        assert_eq!(*api.scopes.lock().unwrap(), vec!["all", "7"]);
    }

    #[tokio::test]
    async fn test_add_appends_and_errors_are_recorded() {
        let store = SongStore::new(Arc::new(FakeSongs::default()));
        store.fetch_song_requests_by_table("7").await.unwrap();

        let created = store
            .add_song_request(&NewSongRequest {
                title: "Bamboleo".into(),
                artist: Some("Gipsy Kings".into()),
                youtube_url: None,
                is_karaoke: true,
                requested_by: Requester {
                    id: "c1".into(),
                    name: "Ana".into(),
                    table_id: "7".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(created.title, "Bamboleo");
        assert_eq!(store.song_requests().len(), 2);

        assert!(store.fetch_song_requests_by_table("down").await.is_err());
        assert!(store.load_state().error().is_some());
        assert_eq!(store.song_requests().len(), 2);
    }

    #[test]
    fn test_wire_shape() {
        let raw = r#"{"id":"1","title":"x","isKaraoke":true,"status":"playing",
            "requestedBy":{"id":"c","name":"n","tableId":"3"},"createdAt":"2024-05-01T12:00:00Z"}"#;
        let parsed: SongRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, SongStatus::Playing);
        assert!(parsed.is_karaoke);
        assert_eq!(parsed.requested_by.table_id, "3");
    }
}
