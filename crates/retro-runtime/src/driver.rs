//! Async driver
//!
//! Runs one endpoint on a tokio task. The task polls the endpoint on a
//! fixed interval and executes closures sent through a [`DriverHandle`],
//! so all endpoint state stays single-writer.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use retro_core::{RetroError, RetroResult, Timestamp};
use retro_transport::Transport;

use crate::{ContributorEndpoint, ModeratorEndpoint};

/// An endpoint the driver can run
pub trait Endpoint: Send + 'static {
    fn poll(&mut self, now: Timestamp);

    fn shutdown(&mut self);
}

impl<T: Transport + Send + 'static> Endpoint for ModeratorEndpoint<T> {
    fn poll(&mut self, now: Timestamp) {
        ModeratorEndpoint::poll(self, now)
    }

    fn shutdown(&mut self) {
        ModeratorEndpoint::shutdown(self)
    }
}

impl<T: Transport + Send + 'static> Endpoint for ContributorEndpoint<T> {
    fn poll(&mut self, now: Timestamp) {
        ContributorEndpoint::poll(self, now)
    }

    fn shutdown(&mut self) {
        ContributorEndpoint::shutdown(self)
    }
}

type Job<E> = Box<dyn FnOnce(&mut E, Timestamp) + Send>;

enum Command<E> {
    Exec(Job<E>),
    Shutdown,
}

/// Control handle for a running driver. Dropping every handle stops it.
pub struct DriverHandle<E> {
    tx: mpsc::UnboundedSender<Command<E>>,
}

impl<E> Clone for DriverHandle<E> {
    fn clone(&self) -> Self {
        DriverHandle {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Endpoint> DriverHandle<E> {
    /// Run `f` on the endpoint inside the driver task and return its result
    pub async fn exec<R, F>(&self, f: F) -> RetroResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut E, Timestamp) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<E> = Box::new(move |endpoint, now| {
            let _ = reply_tx.send(f(endpoint, now));
        });
        self.tx
            .send(Command::Exec(job))
            .map_err(|_| RetroError::Shutdown)?;
        reply_rx.await.map_err(|_| RetroError::Shutdown)
    }

    /// Ask the driver to shut the endpoint down
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Runs an endpoint until shut down
pub struct Driver<E> {
    endpoint: E,
    poll_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command<E>>,
}

impl<E: Endpoint> Driver<E> {
    pub fn new(endpoint: E, poll_interval: Duration) -> (Self, DriverHandle<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            endpoint,
            poll_interval,
            commands: rx,
        };
        (driver, DriverHandle { tx })
    }

    /// Spawn on the current tokio runtime. The join handle yields the
    /// endpoint after shutdown.
    pub fn spawn(endpoint: E, poll_interval: Duration) -> (DriverHandle<E>, JoinHandle<E>) {
        let (driver, handle) = Driver::new(endpoint, poll_interval);
        (handle, tokio::spawn(driver.run()))
    }

    pub async fn run(mut self) -> E {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.endpoint.poll(Timestamp::now());
                }
                command = self.commands.recv() => match command {
                    Some(Command::Exec(job)) => {
                        let now = Timestamp::now();
                        job(&mut self.endpoint, now);
                        self.endpoint.poll(now);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        tracing::debug!("driver stopping");
        self.endpoint.shutdown();
        self.endpoint
    }
}
