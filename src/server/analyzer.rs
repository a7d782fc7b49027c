//! Status analyzer: moves directory servers between NORMAL and DEGRADED
//! based on how many logged changes they are missing.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::proto::{ServerStatus, StatusEvent};
use crate::server::domain::Domain;

/// Running analyzer of one domain.
#[derive(Debug)]
pub(crate) struct StatusAnalyzer {
    threshold: u32,
    interval_ms: u64,
    handle: JoinHandle<()>,
}

impl Drop for StatusAnalyzer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Domain {
    /// Starts the analyzer if it is enabled and not running yet.
    pub(crate) fn start_status_analyzer(self: &Arc<Self>) {
        let (threshold, interval_ms) = self.ctx.with_config(|c| {
            (c.degraded_status_threshold, c.status_analyzer_interval_ms)
        });
        if threshold == 0 {
            return;
        }
        let Ok(mut analyzer) = self.analyzer.lock() else {
            return;
        };
        if analyzer.is_some() {
            return;
        }
        let handle = tokio::spawn(Self::status_analyzer_thread(
            Arc::downgrade(self),
            threshold,
            interval_ms.max(1),
        ));
        *analyzer = Some(StatusAnalyzer {
            threshold,
            interval_ms,
            handle,
        });
        pf_debug!(
            "status analyzer of {} started, threshold {}",
            self.base_dn(),
            threshold
        );
    }

    pub(crate) fn stop_status_analyzer(&self) {
        let stopped = self
            .analyzer
            .lock()
            .ok()
            .and_then(|mut analyzer| analyzer.take());
        if stopped.is_some() {
            pf_debug!("status analyzer of {} stopped", self.base_dn());
        }
    }

    /// Restarts, starts or stops the analyzer to match the current
    /// configuration.
    pub(crate) fn update_status_analyzer(self: &Arc<Self>) {
        let (threshold, interval_ms) = self.ctx.with_config(|c| {
            (c.degraded_status_threshold, c.status_analyzer_interval_ms)
        });
        let current = self
            .analyzer
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|a| (a.threshold, a.interval_ms)));
        if current == Some((threshold, interval_ms)) {
            return;
        }
        self.stop_status_analyzer();
        if threshold > 0 && !self.ds_handlers().is_empty() {
            self.start_status_analyzer();
        }
    }

    pub fn has_status_analyzer(&self) -> bool {
        self.analyzer.lock().is_ok_and(|a| a.is_some())
    }

    /// One analysis round over every connected DS.
    pub(crate) async fn analyze_statuses(&self, threshold: u32) {
        for ds in self.ds_handlers() {
            let status = ds.status();
            if !matches!(status, ServerStatus::Normal | ServerStatus::Degraded) {
                continue;
            }
            let missing = match self.missing_changes(&ds.server_state()).await {
                Ok(missing) => missing,
                Err(e) => {
                    pf_error!("cannot count changes missed by {:?}: {}", ds, e);
                    continue;
                }
            };
            let event = if missing >= u64::from(threshold) {
                StatusEvent::ToDegraded
            } else {
                StatusEvent::ToNormal
            };
            if StatusEvent::leading_to(status) != event
                && self.change_status_from_analyzer(&ds, event).await
            {
                pf_info!("{:?} misses {} changes", ds, missing);
            }
        }
    }

    async fn status_analyzer_thread(
        domain: Weak<Domain>,
        threshold: u32,
        interval_ms: u64,
    ) {
        let mut interval = time::interval(Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(domain) = domain.upgrade() else {
                break;
            };
            if domain.is_shut_down() {
                break;
            }
            domain.analyze_statuses(threshold).await;
        }
    }
}
