use std::sync::Arc;

use bingo_core::BingoClient;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Shared online/offline flag. Subscribers only see transitions.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Returns the event emitted, or `None` when the state did not change.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if !changed {
            return None;
        }
        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        tracing::info!(?event, "connectivity changed");
        Some(event)
    }
}

/// Reachability as seen from the remote's status route. An OS link signal
/// cannot tell a captive portal from the real API.
pub async fn probe_remote(client: &BingoClient) -> bool {
    match client.status().await {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!("remote probe failed: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn emits_only_on_transitions() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());

        assert_eq!(
            connectivity.set_online(true),
            Some(ConnectivityEvent::Online)
        );
        assert_eq!(connectivity.set_online(true), None);
        assert_eq!(
            connectivity.set_online(false),
            Some(ConnectivityEvent::Offline)
        );
        assert_eq!(connectivity.set_online(false), None);
    }

    #[tokio::test]
    async fn subscribers_wake_on_change_only() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let connectivity = Connectivity::new(true);
        let other = connectivity.clone();
        other.set_online(false);
        assert!(!connectivity.is_online());
    }

    #[tokio::test]
    async fn probe_uses_status_route() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("path", "status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "message": "RLC Bingo API is running"
            })))
            .mount(&server)
            .await;

        let client = BingoClient::new(&format!("{}/exec", server.uri())).unwrap();
        assert!(probe_remote(&client).await);

        let down = BingoClient::new("http://127.0.0.1:9/exec").unwrap();
        assert!(!probe_remote(&down).await);
    }
}
