// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::registry::{Registry, SessionHandle};
use super::session::SessionState;
use super::Inner;

/// Move an open session to CLOSE_WAIT so `get_closed` reports it.
pub(super) fn notify_close(registry: &mut Registry, handle: SessionHandle) {
    let session = match registry.get_mut(handle) {
        Some(session) if session.state == SessionState::Opened => session,
        _ => return,
    };
    session.state = SessionState::CloseWait;
    session.stats.idle_time = 0;
    tracing::info!(
        message = "Info: Session close requested",
        protocol = %session.protocol(),
        session_id = session.session_id,
        ppp_id = session.ppp_id
    );
    registry.push_close_wait(handle);
}

/// One tick of the idle clock.
pub(super) fn sweep(inner: &mut Inner, close_timeout: u32) {
    let queues_empty = inner.inq.is_empty() && inner.outq.is_empty();

    for handle in inner.registry.handles() {
        let session = match inner.registry.get_mut(handle) {
            Some(session) => session,
            None => continue,
        };

        match session.state {
            SessionState::Initial => {}
            SessionState::Opened => {
                if session.timeout_sec == 0 {
                    continue;
                }
                session.stats.idle_time += 1;
                if session.stats.idle_time >= session.timeout_sec {
                    notify_close(&mut inner.registry, handle);
                }
            }
            SessionState::CloseWait | SessionState::CloseWait2 => {
                session.stats.idle_time += 1;
                if session.stats.idle_time < close_timeout {
                    continue;
                }
                session.state = SessionState::Closed;
                session.closed_stats = Some(session.snapshot());
                tracing::info!(
                    message = "Info: Session closed",
                    protocol = %session.protocol(),
                    session_id = session.session_id,
                    ppp_id = session.ppp_id
                );
                inner.registry.remove_close_wait(handle);
                if queues_empty {
                    destroy(&mut inner.registry, handle);
                }
            }
            SessionState::Closed => {
                // Queued packets still name this session.
                if queues_empty {
                    destroy(&mut inner.registry, handle);
                }
            }
        }
    }
}

fn destroy(registry: &mut Registry, handle: SessionHandle) {
    if let Some(session) = registry.remove(handle) {
        tracing::debug!(
            message = "Session destroyed",
            protocol = %session.protocol(),
            session_id = session.session_id
        );
    }
}
