//! Session monitor: background policy enforcement for active sessions
//!
//! One long-lived task, off the request path. Every interval it fetches the
//! running-with-active-billing view and evaluates each session in order:
//! age floor, orphan, extreme duration, extreme cost, credit exhaustion —
//! short-circuiting on the first violation. Kills honor a grace period for
//! non-orphan reasons, stop billing best-effort, then delete.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use caldera_billing::BillingEngine;
use caldera_common::config::MonitorConfig;
use caldera_common::types::UserId;
use caldera_store::{ActiveSessionRow, Store};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::SessionManager;

/// Why a session was killed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    OrphanedSession,
    ExtremeDurationExceeded,
    ExtremeCostExceeded,
    ZeroCredits,
    CreditsCriticallyLow,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillReason::OrphanedSession => "orphaned_session",
            KillReason::ExtremeDurationExceeded => "extreme_duration_exceeded",
            KillReason::ExtremeCostExceeded => "extreme_cost_exceeded",
            KillReason::ZeroCredits => "zero_credits",
            KillReason::CreditsCriticallyLow => "credits_critically_low",
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record emitted when a session is killed; delivery is the transport
/// layer's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct KillNotification {
    pub user_id: UserId,
    pub session_id: String,
    pub reason: KillReason,
}

/// Type alias for the monitor task with its cancellation token
type MonitorTask = (JoinHandle<()>, CancellationToken);

/// The monitor's working set, shared between the public handle and the
/// background loop task.
struct MonitorContext {
    store: Arc<Store>,
    billing: Arc<BillingEngine>,
    manager: Arc<SessionManager>,
    config: MonitorConfig,
    notify_tx: mpsc::Sender<KillNotification>,
}

pub struct SessionMonitor {
    context: Arc<MonitorContext>,
    task: Mutex<Option<MonitorTask>>,
}

impl SessionMonitor {
    pub fn new(
        store: Arc<Store>,
        billing: Arc<BillingEngine>,
        manager: Arc<SessionManager>,
        config: MonitorConfig,
        notify_tx: mpsc::Sender<KillNotification>,
    ) -> Self {
        Self {
            context: Arc::new(MonitorContext {
                store,
                billing,
                manager,
                config,
                notify_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the monitoring loop. A second start while running is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some((handle, _)) = task.as_ref() {
            if !handle.is_finished() {
                warn!("Session monitor is already running");
                return;
            }
        }

        let context = self.context.clone();
        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();

        let handle = tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(context.config.check_interval_minutes * 60));
            // The immediate first tick would race session creation at boot
            check_interval.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        info!("Session monitor loop cancelled");
                        break;
                    }
                    _ = check_interval.tick() => {
                        context.run_checks_once().await;
                    }
                }
            }
        });

        *task = Some((handle, cancellation_token));
        info!("Session monitor started");
    }

    /// Stop the monitoring loop, waiting briefly for the task to finish.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;

        if let Some((handle, cancellation_token)) = task.take() {
            cancellation_token.cancel();

            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!("Session monitor stopped"),
                Ok(Err(e)) => warn!("Session monitor task failed: {e}"),
                Err(_) => warn!("Session monitor did not stop within timeout"),
            }
        }
    }

    /// One pass over all active sessions, outside the loop cadence.
    pub async fn run_checks_once(&self) {
        self.context.run_checks_once().await;
    }
}

impl MonitorContext {
    /// One pass over all active sessions. Evaluation is sequential; one
    /// session's failure never stops the loop.
    async fn run_checks_once(&self) {
        let sessions = match self.store.list_active_sessions_for_monitor().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!("Error getting active sessions: {e}");
                return;
            }
        };

        if !sessions.is_empty() {
            debug!("Found {} active sessions to monitor", sessions.len());
        }

        for session in sessions {
            self.check_session(&session).await;
        }
    }

    /// Ordered checks, short-circuiting on the first violation.
    async fn check_session(&self, session: &ActiveSessionRow) {
        let session_id = &session.session_id;
        let now = Utc::now();

        // 1) Too young to touch
        let age = now - session.billing_start_time;
        if age < chrono::Duration::minutes(self.config.min_session_age_minutes as i64) {
            debug!(session_id = %session_id, "Session too young to monitor, skipping");
            return;
        }

        // 2) Orphaned: store row without backend resources
        if !self.manager.session_is_live(session_id).await {
            warn!(session_id = %session_id, "Session is orphaned, cleaning up");
            self.kill_session(session_id, &session.user_id, KillReason::OrphanedSession)
                .await;
            return;
        }

        let hours_used = (now - session.billing_start_time).num_milliseconds() as f64 / 3_600_000.0;

        // 3) Extreme duration
        if hours_used > self.config.max_duration_hours {
            warn!(
                session_id = %session_id,
                "Session exceeded extreme duration limit: {hours_used:.1}h > {}h",
                self.config.max_duration_hours
            );
            self.kill_session(session_id, &session.user_id, KillReason::ExtremeDurationExceeded)
                .await;
            return;
        }

        // 4) Extreme cost, defending against garbage rates
        let hourly_rate = session
            .hourly_rate
            .to_f64()
            .unwrap_or(0.0)
            .clamp(0.0, 1000.0);
        let current_cost = hours_used * hourly_rate;
        if current_cost > self.config.max_cost_usd {
            warn!(
                session_id = %session_id,
                "Session exceeded extreme cost limit: ${current_cost:.2} > ${}",
                self.config.max_cost_usd
            );
            self.kill_session(session_id, &session.user_id, KillReason::ExtremeCostExceeded)
                .await;
            return;
        }

        // 5) Zero or critically low credits
        let credits = match self.store.get_user_credits(&session.user_id).await {
            Ok(credits) => credits.as_decimal().to_f64().unwrap_or(0.0),
            Err(e) => {
                error!(user_id = %session.user_id, "Error checking credits: {e}");
                return;
            }
        };

        if credits <= 0.0 {
            warn!(user_id = %session.user_id, session_id = %session_id, "User has zero credits");
            self.kill_session(session_id, &session.user_id, KillReason::ZeroCredits)
                .await;
            return;
        }

        let runway_floor = hourly_rate * self.config.low_credit_runway_factor;
        if credits < runway_floor {
            warn!(
                user_id = %session.user_id,
                session_id = %session_id,
                "User credits critically low: ${credits:.4} < ${runway_floor:.4}"
            );
            self.kill_session(session_id, &session.user_id, KillReason::CreditsCriticallyLow)
                .await;
        }
    }

    /// Kill with safety checks: re-confirm existence, honor the grace
    /// period for non-orphans, stop billing best-effort, then delete.
    async fn kill_session(&self, session_id: &str, user_id: &UserId, reason: KillReason) {
        warn!(session_id = %session_id, reason = %reason, "Considering session kill");

        let info = match self.manager.get_session(session_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                info!(session_id = %session_id, "Session no longer exists, aborting kill");
                return;
            }
            Err(e) => {
                error!(session_id = %session_id, "Kill pre-check failed: {e}");
                return;
            }
        };

        if reason != KillReason::OrphanedSession {
            let session_age = Utc::now() - info.created_at;
            let grace = chrono::Duration::minutes(self.config.grace_period_minutes as i64);
            if session_age < grace {
                info!(
                    session_id = %session_id,
                    "Session within grace period ({session_age}), aborting kill"
                );
                return;
            }
        }

        warn!(session_id = %session_id, reason = %reason, "Proceeding with session kill");

        // Billing failures are logged, never allowed to prevent the kill
        match self.billing.stop_session_billing(session_id).await {
            Ok(billing) => info!(
                session_id = %session_id,
                total_cost = %billing.total_cost.unwrap_or_default(),
                "Stopped billing for killed session"
            ),
            Err(e) => error!(session_id = %session_id, "Error stopping billing: {e}"),
        }

        match self.manager.delete_session(session_id).await {
            Ok(true) => {
                warn!(session_id = %session_id, reason = %reason, "Session killed");
                let notification = KillNotification {
                    user_id: user_id.clone(),
                    session_id: session_id.to_string(),
                    reason,
                };
                if self.notify_tx.send(notification).await.is_err() {
                    debug!("No listener for kill notifications");
                }
            }
            Ok(false) => error!(session_id = %session_id, "Failed to kill session"),
            Err(e) => error!(session_id = %session_id, "Error killing session: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backdate_billing, eager_monitor_config, Harness};
    use caldera_common::types::{BillingStatus, CreditBalance};
    use rust_decimal_macros::dec;

    async fn running_session(harness: &Harness) -> String {
        let info = harness
            .manager
            .create_session(harness.request())
            .await
            .unwrap();
        info.id
    }

    #[tokio::test]
    async fn test_fresh_session_skipped_by_age_floor() {
        let harness = Harness::new(10.0).await;
        let session_id = running_session(&harness).await;

        let mut config = eager_monitor_config();
        config.min_session_age_minutes = 60;
        let (monitor, _notify_rx) = harness.monitor(config);

        monitor.run_checks_once().await;

        // Still present in every layer
        assert!(harness.jobs.contains(&session_id).await);
        assert!(harness
            .store
            .get_session(&session_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_orphan_reaped_with_billing_completed() {
        let harness = Harness::new(10.0).await;
        let session_id = running_session(&harness).await;

        // Backend loses the session; the store row stays
        harness.jobs.remove(&session_id).await;

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());
        monitor.run_checks_once().await;

        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.reason, KillReason::OrphanedSession);
        assert_eq!(notification.session_id, session_id);

        // Billing row completed with the elapsed hours
        let billing = harness
            .store
            .get_session_billing_info(&session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billing.status, BillingStatus::Completed);
        assert!(billing.total_hours.unwrap() >= dec!(0));

        assert!(harness
            .store
            .get_session(&session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_extreme_duration_kill() {
        let harness = Harness::new(100.0).await;
        let session_id = running_session(&harness).await;

        backdate_billing(&harness.store, &session_id, 49 * 3600).await;

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());
        monitor.run_checks_once().await;

        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.reason, KillReason::ExtremeDurationExceeded);
    }

    #[tokio::test]
    async fn test_extreme_cost_kill_with_rate_clamp() {
        let harness = Harness::new(10_000.0).await;
        let session_id = running_session(&harness).await;

        // A garbage rate is clamped to 1000/h; one hour is enough to trip
        // the 500 USD ceiling
        sqlx::query("UPDATE session_billing SET hourly_rate = '2000' WHERE session_id = ?")
            .bind(&session_id)
            .execute(harness.store.pool())
            .await
            .unwrap();
        backdate_billing(&harness.store, &session_id, 3600).await;

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());
        monitor.run_checks_once().await;

        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.reason, KillReason::ExtremeCostExceeded);
    }

    #[tokio::test]
    async fn test_zero_credits_kill() {
        let harness = Harness::new(0.05).await;
        let session_id = running_session(&harness).await;
        backdate_billing(&harness.store, &session_id, 120).await;

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());

        // 0.05 credits against a 0.025/h rate: plenty of runway, no kill
        monitor.run_checks_once().await;
        assert!(harness.jobs.contains(&session_id).await);

        // Drain the balance to zero; next pass kills
        harness
            .store
            .deduct_credits(
                &UserId::new("alice"),
                CreditBalance::from_f64(0.05).unwrap(),
                "session runtime",
                Some(&session_id),
                None,
            )
            .await
            .unwrap();

        monitor.run_checks_once().await;
        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.reason, KillReason::ZeroCredits);
    }

    #[tokio::test]
    async fn test_critically_low_credits_kill() {
        let harness = Harness::new(10.0).await;
        let session_id = running_session(&harness).await;
        backdate_billing(&harness.store, &session_id, 120).await;

        // Leave less than 0.1 h of runway: rate 0.025 → floor 0.0025
        harness
            .store
            .deduct_credits(
                &UserId::new("alice"),
                CreditBalance::from_f64(9.999).unwrap(),
                "session runtime",
                Some(&session_id),
                None,
            )
            .await
            .unwrap();

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());
        monitor.run_checks_once().await;

        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.reason, KillReason::CreditsCriticallyLow);
    }

    #[tokio::test]
    async fn test_grace_period_aborts_non_orphan_kill() {
        let harness = Harness::new(100.0).await;
        let session_id = running_session(&harness).await;

        // Old enough by billing time, but the session itself is fresh
        backdate_billing(&harness.store, &session_id, 49 * 3600).await;

        let mut config = eager_monitor_config();
        config.grace_period_minutes = 15;
        let (monitor, _notify_rx) = harness.monitor(config);

        monitor.run_checks_once().await;

        // Kill aborted; session survives
        assert!(harness.jobs.contains(&session_id).await);
        assert!(harness
            .store
            .get_session(&session_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_one_failing_session_does_not_stop_the_loop() {
        let harness = Harness::new(10.0).await;

        // An orphan and a healthy session side by side
        let orphan_id = running_session(&harness).await;
        let healthy_id = running_session(&harness).await;
        harness.jobs.remove(&orphan_id).await;

        let (monitor, mut notify_rx) = harness.monitor(eager_monitor_config());
        monitor.run_checks_once().await;

        let notification = notify_rx.recv().await.unwrap();
        assert_eq!(notification.session_id, orphan_id);
        assert!(harness.jobs.contains(&healthy_id).await);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let harness = Harness::new(10.0).await;
        let (monitor, _notify_rx) = harness.monitor(eager_monitor_config());

        monitor.start().await;
        // Double start is a no-op
        monitor.start().await;
        monitor.stop().await;
        // Double stop is harmless
        monitor.stop().await;
    }
}
