// Asynchronous bring-up: event callbacks forward messages to a single worker
// that owns the driver and the state machine.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::bootstrap::System;
use crate::config::StaticIp;
use crate::connection::{ConnectionManager, Credentials, Progress, WifiDriver, WifiEvent};
use crate::error::{DriverError, RestartReason};

const WORKER_STACK_SIZE: usize = 16 * 1024;

/// Source of station events. Dropping a subscription deregisters it.
pub trait WifiEventSource {
    type Subscription: Send + 'static;

    fn subscribe<F>(&self, handler: F) -> Result<Self::Subscription, DriverError>
    where
        F: FnMut(WifiEvent) + Send + 'static;
}

#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("failed to subscribe to wifi events: {0}")]
    Subscribe(#[source] DriverError),
    #[error("failed to start station interface: {0}")]
    Start(#[source] DriverError),
    #[error("failed to apply static ip: {0}")]
    StaticIp(#[source] DriverError),
    #[error("failed to spawn bring-up worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<BringUpError> for RestartReason {
    fn from(err: BringUpError) -> Self {
        match err {
            BringUpError::Subscribe(e) | BringUpError::Start(e) | BringUpError::StaticIp(e) => {
                RestartReason::NetworkInit(e)
            }
            BringUpError::Spawn(e) => {
                RestartReason::NetworkInit(DriverError::new("spawn bring-up worker", e.to_string()))
            }
        }
    }
}

/// A running bring-up. [`BringUp::wait`] blocks until the station connects.
pub struct BringUp<S> {
    ready: Receiver<()>,
    session: Option<S>,
    link: S,
    worker: JoinHandle<()>,
}

/// Returned once the station is connected. Keeps the disconnect watch alive.
pub struct Link<S> {
    _watch: S,
    worker: JoinHandle<()>,
}

impl<S> Link<S> {
    pub fn worker_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl<S: Send + 'static> BringUp<S> {
    /// Register handlers, start the interface, apply the static address and
    /// hand the driver to the worker. Returns without waiting for the scan.
    pub fn launch<D, E, Y>(
        mut driver: D,
        events: &E,
        credentials: Credentials,
        static_ip: &StaticIp,
        system: Arc<Y>,
    ) -> Result<Self, BringUpError>
    where
        D: WifiDriver + 'static,
        E: WifiEventSource<Subscription = S>,
        Y: System + ?Sized + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel::<WifiEvent>();
        let (ready_tx, ready) = mpsc::sync_channel::<()>(1);

        // Bring-up handlers go away after the wait; the disconnect watch stays
        let session_tx = event_tx.clone();
        let session = events
            .subscribe(move |event| {
                if event != WifiEvent::StaDisconnected {
                    forward(&session_tx, event);
                }
            })
            .map_err(BringUpError::Subscribe)?;
        let link = events
            .subscribe(move |event| {
                if event == WifiEvent::StaDisconnected {
                    forward(&event_tx, event);
                }
            })
            .map_err(BringUpError::Subscribe)?;

        log::info!("Starting station interface");
        driver.start().map_err(BringUpError::Start)?;
        driver.set_static_ip(static_ip).map_err(BringUpError::StaticIp)?;
        log::info!(
            "Static ip {} netmask {} gateway {}",
            static_ip.address,
            static_ip.netmask,
            static_ip
                .gateway
                .map(|g| g.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let manager = ConnectionManager::new(driver, credentials);
        let worker = thread::Builder::new()
            .name("wifi-bringup".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || run_worker(manager, event_rx, ready_tx, system))
            .map_err(BringUpError::Spawn)?;

        Ok(Self {
            ready,
            session: Some(session),
            link,
            worker,
        })
    }

    /// Block until the station connects, then deregister the bring-up
    /// handlers. Consumes the bring-up so the wait happens once.
    pub fn wait(mut self) -> Result<Link<S>, RestartReason> {
        log::info!("Waiting for station to connect");
        let signalled = self.ready.recv();

        // Deregister before anything else runs on the connection
        drop(self.session.take());

        match signalled {
            Ok(()) => {
                log::info!("Station ready, bring-up handlers removed");
                Ok(Link {
                    _watch: self.link,
                    worker: self.worker,
                })
            }
            Err(_) => {
                log::error!("Bring-up worker exited without a connection");
                Err(RestartReason::BringUpAborted)
            }
        }
    }
}

fn forward(tx: &Sender<WifiEvent>, event: WifiEvent) {
    if tx.send(event).is_err() {
        log::warn!("Dropped {:?}: bring-up worker is gone", event);
    }
}

fn run_worker<D, Y>(
    mut manager: ConnectionManager<D>,
    events: Receiver<WifiEvent>,
    ready: SyncSender<()>,
    system: Arc<Y>,
) where
    D: WifiDriver,
    Y: System + ?Sized,
{
    let mut ready = Some(ready);

    // Ends when every subscription has been dropped
    while let Ok(event) = events.recv() {
        log::debug!("Wifi event {:?} in state {:?}", event, manager.state());
        match manager.on_event(event) {
            Ok(Progress::Ready) => {
                if let Some(tx) = ready.take() {
                    // Capacity 1 and a single send, so this never blocks
                    let _ = tx.try_send(());
                }
            }
            Ok(Progress::Pending) => {}
            Err(reason) => system.restart(reason),
        }
    }
    log::debug!("Wifi event channel closed, bring-up worker exiting");
}

/// Launch and wait in one call: returns once the station is connected.
/// Any fatal condition restarts the device from the worker.
pub fn connect<D, E, Y>(
    driver: D,
    events: &E,
    credentials: Credentials,
    static_ip: &StaticIp,
    system: Arc<Y>,
) -> Result<Link<E::Subscription>, RestartReason>
where
    D: WifiDriver + 'static,
    E: WifiEventSource,
    Y: System + ?Sized + 'static,
{
    BringUp::launch(driver, events, credentials, static_ip, system)?.wait()
}
