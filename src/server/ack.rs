//! Pending assured updates waiting for acknowledgments.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

use crate::proto::{AckMsg, AssuredMode, ChangeNumber, ServerId};
use crate::server::handler::ConnectionHandler;

/// Acknowledgments still expected for one assured update.
#[derive(Debug)]
struct AckState {
    /// Expected server -> whether its ack arrived.
    expected: BTreeMap<ServerId, bool>,
    received: usize,

    has_timeout: bool,
    has_wrong_status: bool,
    has_replay_error: bool,
    failed_servers: Vec<ServerId>,

    /// Set once the final ack has been produced, by whichever of
    /// "last ack arrived" and "timeout fired" came first.
    completed: bool,
}

/// One assured update waiting for acknowledgments from other servers.
#[derive(Debug)]
pub struct AckWaitEntry {
    cn: ChangeNumber,
    mode: AssuredMode,

    requester: Arc<ConnectionHandler>,
    state: Mutex<AckState>,
    timer: Mutex<Option<AbortHandle>>,
}

impl AckWaitEntry {
    /// Safe-read entry. DSs already known to be in a wrong status are
    /// reported as failed in the final ack without being waited for.
    pub(crate) fn safe_read(
        cn: ChangeNumber,
        requester: Arc<ConnectionHandler>,
        expected: Vec<ServerId>,
        wrong_status: Vec<ServerId>,
    ) -> Self {
        let has_wrong_status = !wrong_status.is_empty();
        Self::new(
            cn,
            AssuredMode::SafeRead,
            requester,
            expected,
            has_wrong_status,
            wrong_status,
        )
    }

    /// Safe-data entry expecting an ack from every eligible RS.
    pub(crate) fn safe_data(
        cn: ChangeNumber,
        requester: Arc<ConnectionHandler>,
        expected: Vec<ServerId>,
    ) -> Self {
        Self::new(
            cn,
            AssuredMode::SafeData,
            requester,
            expected,
            false,
            vec![],
        )
    }

    fn new(
        cn: ChangeNumber,
        mode: AssuredMode,
        requester: Arc<ConnectionHandler>,
        expected: Vec<ServerId>,
        has_wrong_status: bool,
        failed_servers: Vec<ServerId>,
    ) -> Self {
        AckWaitEntry {
            cn,
            mode,
            requester,
            state: Mutex::new(AckState {
                expected: expected.into_iter().map(|id| (id, false)).collect(),
                received: 0,
                has_timeout: false,
                has_wrong_status,
                has_replay_error: false,
                failed_servers,
                completed: false,
            }),
            timer: Mutex::new(None),
        }
    }

    #[inline]
    pub fn cn(&self) -> ChangeNumber {
        self.cn
    }

    #[inline]
    pub fn mode(&self) -> AssuredMode {
        self.mode
    }

    #[inline]
    pub fn requester(&self) -> &Arc<ConnectionHandler> {
        &self.requester
    }

    pub(crate) fn set_timer(&self, timer: AbortHandle) {
        if let Ok(mut slot) = self.timer.lock() {
            *slot = Some(timer);
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().ok().and_then(|mut t| t.take()) {
            timer.abort();
        }
    }

    /// Records an ack from `from`. Returns the final ack for the requester
    /// if this ack completed the entry. Acks from unexpected servers and
    /// duplicates are ignored.
    pub(crate) fn process_ack(
        &self,
        from: ServerId,
        ack: &AckMsg,
    ) -> Option<AckMsg> {
        let final_ack = {
            let mut state = self.state.lock().ok()?;
            if state.completed {
                return None;
            }
            match state.expected.get(&from) {
                Some(false) => {}
                Some(true) => {
                    pf_debug!("duplicate ack for {} from {}", self.cn, from);
                    return None;
                }
                None => {
                    pf_debug!("unexpected ack for {} from {}", self.cn, from);
                    return None;
                }
            }

            state.has_timeout |= ack.has_timeout;
            state.has_wrong_status |= ack.has_wrong_status;
            state.has_replay_error |= ack.has_replay_error;
            for id in ack.failed_servers.iter() {
                if !state.failed_servers.contains(id) {
                    state.failed_servers.push(*id);
                }
            }
            state.expected.insert(from, true);
            state.received += 1;

            if state.received < state.expected.len() {
                return None;
            }
            state.completed = true;
            self.build_ack(&state, false)
        };
        self.cancel_timer();
        Some(final_ack)
    }

    /// Completes the entry on timeout. Returns the final ack and the
    /// servers that never answered, unless the entry was already completed.
    pub(crate) fn on_timeout(&self) -> Option<(AckMsg, Vec<ServerId>)> {
        let mut state = self.state.lock().ok()?;
        if state.completed {
            return None;
        }
        state.completed = true;
        let missing: Vec<ServerId> = state
            .expected
            .iter()
            .filter(|(_, acked)| !**acked)
            .map(|(id, _)| *id)
            .collect();
        Some((self.build_ack(&state, true), missing))
    }

    /// Completes the entry without producing any ack.
    pub(crate) fn abandon(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.completed = true;
        }
        self.cancel_timer();
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(true)
    }

    fn build_ack(&self, state: &AckState, timed_out: bool) -> AckMsg {
        let mut ack = AckMsg::new(self.cn);
        ack.has_wrong_status = state.has_wrong_status;
        ack.has_replay_error = state.has_replay_error;
        ack.has_timeout = state.has_timeout;
        ack.failed_servers = state.failed_servers.clone();
        if timed_out {
            for (id, acked) in state.expected.iter() {
                if !*acked {
                    ack.has_timeout = true;
                    if !ack.failed_servers.contains(id) {
                        ack.failed_servers.push(*id);
                    }
                }
            }
        }
        ack
    }
}

#[cfg(test)]
mod ack_tests {
    use super::*;
    use crate::proto::{ServerState, ServerStatus, PROTOCOL_V2};
    use crate::server::handler::{DsAttrs, HandlerSetup};
    use crate::server::session::session_pair;

    fn requester() -> Arc<ConnectionHandler> {
        let ((tx, _), _) = session_pair();
        ConnectionHandler::new_ds(
            HandlerSetup {
                server_id: 1,
                server_url: "ds-1".into(),
                base_dn: "dc=example".into(),
                protocol_version: PROTOCOL_V2,
                group_id: 1,
                generation_id: 42,
                send_window: 10,
                recv_window: 10,
                queue_size: 10,
                server_state: ServerState::new(),
            },
            DsAttrs {
                status: ServerStatus::Normal,
                ref_urls: vec![],
                assured_flag: true,
                assured_mode: AssuredMode::SafeRead,
                safe_data_level: 1,
            },
            tx,
        )
    }

    #[test]
    fn completes_on_last_ack() {
        let cn = ChangeNumber::new(100, 0, 1);
        let entry = AckWaitEntry::safe_data(cn, requester(), vec![201, 202]);
        assert!(entry.process_ack(201, &AckMsg::new(cn)).is_none());
        assert!(entry.process_ack(201, &AckMsg::new(cn)).is_none());
        assert!(entry.process_ack(999, &AckMsg::new(cn)).is_none());
        let ack = entry.process_ack(202, &AckMsg::new(cn));
        assert_eq!(ack, Some(AckMsg::new(cn)));
        assert!(entry.is_completed());
        assert!(entry.on_timeout().is_none());
    }

    #[test]
    fn timeout_names_missing() {
        let cn = ChangeNumber::new(100, 0, 1);
        let entry = AckWaitEntry::safe_data(cn, requester(), vec![201, 202]);
        assert!(entry.process_ack(201, &AckMsg::new(cn)).is_none());
        let (ack, missing) = entry.on_timeout().unwrap();
        assert!(ack.has_timeout);
        assert_eq!(ack.failed_servers, vec![202]);
        assert_eq!(missing, vec![202]);
        // late ack after timeout changes nothing
        assert!(entry.process_ack(202, &AckMsg::new(cn)).is_none());
        assert!(entry.on_timeout().is_none());
    }

    #[test]
    fn safe_read_merges_errors() {
        let cn = ChangeNumber::new(7, 0, 1);
        let entry =
            AckWaitEntry::safe_read(cn, requester(), vec![2, 3], vec![4]);
        let mut replay = AckMsg::new(cn);
        replay.has_replay_error = true;
        replay.failed_servers = vec![2];
        assert!(entry.process_ack(2, &replay).is_none());
        let ack = entry.process_ack(3, &AckMsg::new(cn)).unwrap();
        assert!(ack.has_wrong_status);
        assert!(ack.has_replay_error);
        assert!(!ack.has_timeout);
        assert_eq!(ack.failed_servers, vec![4, 2]);
        assert!(!ack.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_acks_and_timeout_complete_once() {
        let requester = requester();
        for round in 0..200 {
            let cn = ChangeNumber::new(1000 + round, 0, 1);
            let entry = Arc::new(AckWaitEntry::safe_data(
                cn,
                requester.clone(),
                vec![201, 202, 203],
            ));
            let barrier = Arc::new(tokio::sync::Barrier::new(4));

            let mut tasks = vec![];
            for from in [201, 202, 203] {
                let entry = entry.clone();
                let barrier = barrier.clone();
                tasks.push(tokio::spawn(async move {
                    barrier.wait().await;
                    entry.process_ack(from, &AckMsg::new(cn)).is_some()
                }));
            }
            let timeout = {
                let entry = entry.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    entry.on_timeout().is_some()
                })
            };

            let mut completions = 0;
            for task in tasks {
                if task.await.unwrap() {
                    completions += 1;
                }
            }
            if timeout.await.unwrap() {
                completions += 1;
            }
            assert_eq!(completions, 1, "round {}", round);
            assert!(entry.is_completed());
        }
    }
}
