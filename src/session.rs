//! Session orchestration: ties the scenario, the relay client, and the
//! per-channel handlers together for one run.
//!
//! The session connects, waits for the relay to report `Ready`, builds the
//! handlers its role calls for, and then polls for completion on a coarse
//! tick. Teardown is ordered: subscribers are unsubscribed, publisher loops
//! are stopped and joined (guaranteeing no publish after the stop returns),
//! tracks are unpublished, and the relay is disconnected. Terminal session
//! statuses abort the run with an error the caller turns into a non-zero
//! exit.

use crate::cli::{Args, Role};
use crate::defaults;
use crate::publisher::PublishHandler;
use crate::report::{PublishReport, SubscribeReport};
use crate::scenario::Scenario;
use crate::subscriber::SubscribeHandler;
use crate::transport::{RelayClient, SessionStatus};
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// Cooperative cancellation token for a run.
///
/// Created at the top level (typically wired to Ctrl-C) and passed into the
/// session, which propagates it to every handler's stop path. Cloning shares
/// the same trigger.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once the token has been triggered.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Identity and role of this harness instance within a conference.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub role: Role,
    pub endpoint_id: String,
    pub conference_id: u32,
    pub instance_id: u32,
    pub instances: u32,
}

impl From<&Args> for SessionSettings {
    fn from(args: &Args) -> Self {
        Self {
            role: args.role,
            endpoint_id: args.endpoint_id.clone(),
            conference_id: args.conference_id,
            instance_id: args.instance_id,
            instances: args.instances,
        }
    }
}

/// Instance ids are namespaced by conference so concurrent conferences never
/// collide on channel names.
pub fn effective_instance_id(instance_id: u32, conference_id: u32) -> u32 {
    instance_id + conference_id * 1000
}

struct PublisherEntry {
    handler: Arc<PublishHandler>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Handlers {
    started: bool,
    publishers: Vec<PublisherEntry>,
    subscribers: Vec<Arc<SubscribeHandler>>,
}

/// One client session against a relay.
pub struct PerfSession<R: RelayClient> {
    relay: Arc<R>,
    scenario: Scenario,
    settings: SessionSettings,
    shutdown: ShutdownToken,
    handlers: Mutex<Handlers>,
}

impl<R: RelayClient> PerfSession<R> {
    pub fn new(
        relay: Arc<R>,
        scenario: Scenario,
        settings: SessionSettings,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            relay,
            scenario,
            settings,
            shutdown,
            handlers: Mutex::new(Handlers::default()),
        }
    }

    /// Run the session to completion, cancellation, or failure; returns the
    /// collected per-channel reports.
    pub async fn run(&self) -> Result<(Vec<PublishReport>, Vec<SubscribeReport>)> {
        info!(
            endpoint = %self.settings.endpoint_id,
            role = %self.settings.role,
            conference_id = self.settings.conference_id,
            instance_id = self.settings.instance_id,
            instances = self.settings.instances,
            "connecting to relay"
        );
        let mut status_rx = self
            .relay
            .connect()
            .await
            .context("failed to connect to relay")?;

        let mut poll = tokio::time::interval(defaults::COMPLETION_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_status = None;

        let outcome = loop {
            let status = *status_rx.borrow_and_update();
            if last_status != Some(status) {
                info!(status = %status, "session status");
                last_status = Some(status);
            }
            match status {
                SessionStatus::Ready => {
                    if let Err(e) = self.start_handlers().await {
                        break Err(e);
                    }
                }
                s if s.is_terminal() => {
                    break Err(anyhow!("session failed with status {s}"));
                }
                _ => {}
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, terminating session");
                    break Ok(());
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break Err(anyhow!("relay closed the status channel"));
                    }
                }
                _ = poll.tick() => {
                    if self.handlers_complete().await {
                        info!("all handlers complete");
                        break Ok(());
                    }
                }
            }
        };

        self.terminate().await;
        self.relay.disconnect().await;

        let reports = self.collect_reports().await;
        outcome.map(|()| reports)
    }

    /// Peers whose channels this instance subscribes to. A single-instance
    /// run reads back its own channels, which makes a loopback session
    /// self-contained; multi-instance runs skip their own id.
    fn peer_instances(&self) -> Vec<u32> {
        if self.settings.instances <= 1 {
            vec![self.settings.instance_id]
        } else {
            (1..=self.settings.instances)
                .filter(|i| *i != self.settings.instance_id)
                .collect()
        }
    }

    async fn start_handlers(&self) -> Result<()> {
        let mut handlers = self.handlers.lock().await;
        if handlers.started {
            return Ok(());
        }
        handlers.started = true;

        if self.settings.role.publishes() {
            let own =
                effective_instance_id(self.settings.instance_id, self.settings.conference_id);
            for config in self.scenario.configs_for_instance(own) {
                let delivery_mode = config.delivery_mode;
                let handler = PublishHandler::new(config);
                let publisher = self
                    .relay
                    .publish_track(handler.channel(), delivery_mode, handler.clone())
                    .await
                    .with_context(|| {
                        format!("failed to publish channel {}", handler.channel())
                    })?;
                let task = tokio::spawn(handler.clone().run_writer(publisher));
                handlers.publishers.push(PublisherEntry {
                    handler,
                    task: Some(task),
                });
            }
        }

        if self.settings.role.subscribes() {
            for peer in self.peer_instances() {
                let effective = effective_instance_id(peer, self.settings.conference_id);
                for config in self.scenario.configs_for_instance(effective) {
                    let handler = SubscribeHandler::new(config, effective)?;
                    self.relay
                        .subscribe_track(handler.channel(), handler.clone())
                        .await
                        .with_context(|| {
                            format!("failed to subscribe channel {}", handler.channel())
                        })?;
                    handlers.subscribers.push(handler);
                }
            }
        }

        Ok(())
    }

    async fn handlers_complete(&self) -> bool {
        let handlers = self.handlers.lock().await;
        if !handlers.started
            || (handlers.publishers.is_empty() && handlers.subscribers.is_empty())
        {
            return false;
        }
        handlers.publishers.iter().all(|p| p.handler.is_finished())
            && handlers.subscribers.iter().all(|s| s.is_complete())
    }

    async fn terminate(&self) {
        let mut handlers = self.handlers.lock().await;

        for subscriber in &handlers.subscribers {
            info!(channel = %subscriber.channel(), "unsubscribing");
            self.relay.unsubscribe_track(subscriber.channel()).await;
        }

        for entry in handlers.publishers.iter_mut() {
            entry.handler.request_stop();
            if let Some(task) = entry.task.take() {
                // Join before unpublishing: no publish happens after this.
                let _ = task.await;
            }
            self.relay.unpublish_track(entry.handler.channel()).await;
        }
    }

    async fn collect_reports(&self) -> (Vec<PublishReport>, Vec<SubscribeReport>) {
        let handlers = self.handlers.lock().await;
        let publishers = handlers
            .publishers
            .iter()
            .map(|entry| entry.handler.report())
            .collect();
        let subscribers = handlers
            .subscribers
            .iter()
            .filter_map(|handler| handler.report())
            .collect();
        (publishers, subscribers)
    }
}
