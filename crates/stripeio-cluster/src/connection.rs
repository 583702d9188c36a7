//! Auto-reconnecting drive connection.
//!
//! Wraps one logical drive session over a primary/secondary endpoint
//! pair. The first `get` connects synchronously; after a failure the
//! connection reconnects in the background, rate-limited by the cluster's
//! reconnect interval, and callers fail fast until a session is back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stripeio_common::{BackgroundHandler, DriveEndpoint, Error, Result};
use stripeio_rpc::{DriveClient, DriveConnector};
use tracing::{debug, info, warn};

struct ConnState {
    client: Option<Arc<dyn DriveClient>>,
    last_attempt: Option<Instant>,
    last_error: String,
}

pub struct AutoConnection {
    connector: Arc<dyn DriveConnector>,
    primary: DriveEndpoint,
    secondary: DriveEndpoint,
    reconnect_interval: Duration,
    state: tokio::sync::Mutex<ConnState>,
    /// Single-slot executor for background reconnects; a second reconnect
    /// cannot pile up while one is in flight.
    reconnector: BackgroundHandler,
}

impl AutoConnection {
    pub fn new(
        connector: Arc<dyn DriveConnector>,
        primary: DriveEndpoint,
        secondary: DriveEndpoint,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            primary,
            secondary,
            reconnect_interval,
            state: tokio::sync::Mutex::new(ConnState {
                client: None,
                last_attempt: None,
                last_error: "never connected".into(),
            }),
            reconnector: BackgroundHandler::new(1, 0),
        })
    }

    /// Obtain the drive session.
    ///
    /// Healthy connections return a shared handle. The very first call
    /// connects on the caller; later failures only schedule a rate-limited
    /// background reconnect and fail fast.
    pub async fn get(self: &Arc<Self>) -> Result<Arc<dyn DriveClient>> {
        let mut state = self.state.lock().await;
        if let Some(client) = &state.client {
            return Ok(Arc::clone(client));
        }

        if state.last_attempt.is_none() {
            Self::connect(self, &mut state).await;
            if let Some(client) = &state.client {
                return Ok(Arc::clone(client));
            }
        } else if state
            .last_attempt
            .is_some_and(|t| t.elapsed() >= self.reconnect_interval)
        {
            let this = Arc::clone(self);
            self.reconnector.try_run(async move {
                let mut state = this.state.lock().await;
                if state.client.is_none() {
                    Self::connect(&this, &mut state).await;
                }
            });
        }

        Err(Error::Connection(format!(
            "{}: {}",
            self.primary.address(),
            state.last_error
        )))
    }

    /// Drop the session after a transport-level failure. The next `get`
    /// arranges reconnection.
    pub async fn set_error(&self) {
        let mut state = self.state.lock().await;
        if state.client.take().is_some() {
            warn!("connection to {} marked unhealthy", self.primary.address());
        }
    }

    async fn connect(this: &Arc<Self>, state: &mut ConnState) {
        if state
            .last_attempt
            .is_some_and(|t| t.elapsed() < this.reconnect_interval)
        {
            return;
        }
        state.last_attempt = Some(Instant::now());

        // Prioritization between the two endpoints is randomized so a
        // half-dead primary cannot capture every connection in the fleet.
        let mut order = [&this.primary, &this.secondary];
        if rand::random::<bool>() {
            order.swap(0, 1);
        }

        for endpoint in order {
            match this.connector.connect(endpoint).await {
                Ok(client) => {
                    // Probe the fresh session before trusting it.
                    if let Err(e) = client.no_op().await {
                        debug!("session probe to {} failed: {e}", endpoint.address());
                        state.last_error = e.to_string();
                        continue;
                    }
                    info!("connected to drive at {}", endpoint.address());
                    state.client = Some(client);
                    return;
                }
                Err(e) => {
                    debug!("connect to {} failed: {e}", endpoint.address());
                    state.last_error = e.to_string();
                }
            }
        }
        warn!(
            "failed building connection to {} and {}",
            this.primary.address(),
            this.secondary.address()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripeio_rpc::sim::sim_fleet;
    use tokio::time::sleep;

    fn connection(interval: Duration) -> (Arc<AutoConnection>, Vec<Arc<stripeio_rpc::sim::SimDrive>>) {
        let (connector, endpoints, drives) = sim_fleet(1, 1024);
        let conn = AutoConnection::new(
            connector,
            endpoints[0].clone(),
            endpoints[0].clone(),
            interval,
        );
        (conn, drives)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_get_connects_synchronously() {
        let (conn, _drives) = connection(Duration::from_secs(10));
        assert!(conn.get().await.is_ok());
        assert!(conn.get().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_first_connect_is_rate_limited() {
        let (conn, drives) = connection(Duration::from_secs(60));
        drives[0].stop();

        assert!(conn.get().await.is_err());
        drives[0].start();
        // Inside the reconnect interval the connection fails fast without
        // attempting the drive again.
        assert!(conn.get().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_reconnect_after_interval() {
        let (conn, drives) = connection(Duration::from_millis(50));
        drives[0].stop();
        assert!(conn.get().await.is_err());

        drives[0].start();
        sleep(Duration::from_millis(60)).await;

        // This call schedules the background reconnect and still fails.
        assert!(conn.get().await.is_err());
        sleep(Duration::from_millis(30)).await;
        assert!(conn.get().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_error_drops_session() {
        let (conn, _drives) = connection(Duration::from_millis(10));
        assert!(conn.get().await.is_ok());
        conn.set_error().await;
        sleep(Duration::from_millis(20)).await;
        // Unhealthy now; the first call after the interval schedules the
        // reconnect and fails, the background task then restores health.
        let _ = conn.get().await;
        sleep(Duration::from_millis(30)).await;
        assert!(conn.get().await.is_ok());
    }
}
