use bytes::Bytes;
use std::{sync::Arc, time::SystemTime};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{PedalError, Result},
    protocol::Command,
    transport::{AttemptId, AttemptIds, CharacteristicRef, Transport},
    types::{ChannelReport, ChannelState, Parameter, SessionOutput},
};

struct WriteAttempt {
    id: AttemptId,
    command: Command,
    payload: Bytes,
    failures: u32,
    cancelled: bool,
}

struct ChannelInner {
    characteristic: Option<CharacteristicRef>,
    state: ChannelState,
    committed: Option<f64>,
    attempt: Option<WriteAttempt>,
}

/// Write-with-retry state machine for one controllable parameter
///
/// At most one write attempt is live. Submitting a new value supersedes the
/// attempt in flight, and an acknowledgement only counts if it carries the
/// id of the live attempt. All state changes happen under one lock that is
/// held across the transport submission, so a superseded attempt can never
/// be written after its successor.
pub struct ControlChannel {
    parameter: Parameter,
    transport: Arc<dyn Transport>,
    attempts: AttemptIds,
    retry_limit: u32,
    reports: mpsc::UnboundedSender<SessionOutput>,
    inner: Mutex<ChannelInner>,
}

impl ControlChannel {
    /// Create an unbound channel
    ///
    /// `attempts` should be shared with every other channel of the same
    /// session so that attempt ids stay unique per link.
    #[must_use]
    pub fn new(
        parameter: Parameter,
        transport: Arc<dyn Transport>,
        attempts: AttemptIds,
        retry_limit: u32,
        reports: mpsc::UnboundedSender<SessionOutput>,
    ) -> Self {
        Self {
            parameter,
            transport,
            attempts,
            retry_limit,
            reports,
            inner: Mutex::new(ChannelInner {
                characteristic: None,
                state: ChannelState::Idle,
                committed: None,
                attempt: None,
            }),
        }
    }

    /// Parameter this channel controls
    #[must_use]
    pub const fn parameter(&self) -> Parameter {
        self.parameter
    }

    /// Attach the characteristic writes go to
    pub async fn bind(&self, characteristic: CharacteristicRef) {
        debug!("{} channel bound to {}", self.parameter, characteristic);
        self.inner.lock().await.characteristic = Some(characteristic);
    }

    /// Characteristic writes go to, once discovered
    pub async fn characteristic(&self) -> Option<CharacteristicRef> {
        self.inner.lock().await.characteristic
    }

    /// Current write state
    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Last value the peripheral acknowledged
    pub async fn committed(&self) -> Option<f64> {
        self.inner.lock().await.committed
    }

    /// Value of the live attempt, if one is in flight
    pub async fn pending(&self) -> Option<f64> {
        self.inner
            .lock()
            .await
            .attempt
            .as_ref()
            .filter(|attempt| !attempt.cancelled)
            .map(|attempt| attempt.command.value())
    }

    /// Validate `value` and write it
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Validation`] if the value is out of range, after
    /// emitting a [`ChannelReport::Rejected`]. Returns
    /// [`PedalError::NotReady`] if the channel has no characteristic yet.
    pub async fn submit(&self, value: f64) -> Result<AttemptId> {
        match Command::new(self.parameter, value) {
            Ok(command) => self.write(command).await,
            Err(error) => {
                warn!("Rejected {} command: {}", self.parameter, error);
                self.report(ChannelReport::Rejected {
                    parameter: self.parameter,
                    value,
                    reason: error.to_string(),
                    timestamp: SystemTime::now(),
                });
                Err(error.into())
            }
        }
    }

    /// Write a validated command, superseding any attempt in flight
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::NotReady`] if the channel has no characteristic
    /// yet, or [`PedalError::InvalidParameters`] if the command belongs to
    /// another parameter.
    pub async fn write(&self, command: Command) -> Result<AttemptId> {
        if command.parameter() != self.parameter {
            return Err(PedalError::InvalidParameters(format!(
                "{} command sent to the {} channel",
                command.parameter(),
                self.parameter
            )));
        }

        let mut inner = self.inner.lock().await;
        let characteristic = inner.characteristic.ok_or_else(|| PedalError::NotReady {
            reason: format!("{} characteristic not discovered", self.parameter),
        })?;

        if let Some(previous) = inner.attempt.as_ref().filter(|a| !a.cancelled) {
            debug!(
                "{} attempt {} superseded before acknowledgement",
                self.parameter, previous.id
            );
        }

        let id = self.attempts.allocate();
        let payload = command.encode();
        debug!(
            "{} attempt {}: writing {} as {:02X?}",
            self.parameter,
            id,
            command.value(),
            &payload[..]
        );

        inner.attempt = Some(WriteAttempt {
            id,
            command,
            payload,
            failures: 0,
            cancelled: false,
        });
        inner.state = ChannelState::Writing(id);

        self.issue(&mut inner, characteristic).await;
        Ok(id)
    }

    /// Handle a write acknowledgement
    ///
    /// Returns `true` if the acknowledgement committed the live attempt.
    pub async fn on_write_succeeded(
        &self,
        characteristic: &CharacteristicRef,
        attempt: AttemptId,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.characteristic.as_ref() != Some(characteristic) {
            return false;
        }

        let Some(done) = inner
            .attempt
            .take_if(|live| live.id == attempt && !live.cancelled)
        else {
            debug!("{} ignoring stale acknowledgement {}", self.parameter, attempt);
            return false;
        };

        let value = done.command.value();
        inner.committed = Some(value);
        inner.state = ChannelState::Committed;
        drop(inner);

        info!("{} set to {} {}", self.parameter, value, self.parameter.unit_name());
        self.report(ChannelReport::Committed {
            parameter: self.parameter,
            value,
            timestamp: SystemTime::now(),
        });
        true
    }

    /// Handle a failed write, retrying the live attempt while under the limit
    ///
    /// Returns `true` if the failure belonged to the live attempt.
    pub async fn on_write_failed(
        &self,
        characteristic: &CharacteristicRef,
        attempt: AttemptId,
        error: &str,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.characteristic.as_ref() != Some(characteristic) {
            return false;
        }
        if !inner.attempt.as_ref().is_some_and(|live| live.id == attempt) {
            debug!("{} ignoring stale failure {}", self.parameter, attempt);
            return false;
        }

        warn!("{} attempt {} failed: {}", self.parameter, attempt, error);
        if self.record_failure(&mut inner) {
            self.issue(&mut inner, *characteristic).await;
        }
        true
    }

    /// Log a successful notification subscription
    pub async fn on_notify_enabled(&self, characteristic: &CharacteristicRef) -> bool {
        if self.characteristic().await.as_ref() != Some(characteristic) {
            return false;
        }
        info!("{} notifications enabled on {}", self.parameter, characteristic);
        true
    }

    /// Re-request notifications after a failed subscription
    pub async fn on_notify_failed(&self, characteristic: &CharacteristicRef, error: &str) -> bool {
        if self.characteristic().await.as_ref() != Some(characteristic) {
            return false;
        }
        warn!(
            "{} notifications on {} failed ({}), retrying",
            self.parameter, characteristic, error
        );
        if let Err(e) = self.transport.enable_notifications(characteristic).await {
            warn!("{} could not re-request notifications: {}", self.parameter, e);
        }
        true
    }

    /// Cancel the live attempt; late acknowledgements for it are ignored
    pub async fn cancel(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(live) = inner.attempt.as_mut().filter(|a| !a.cancelled) {
            live.cancelled = true;
            debug!("{} attempt {} cancelled", self.parameter, live.id);
            inner.state = ChannelState::Idle;
        }
    }

    /// Submit the live attempt's payload until the transport accepts it or
    /// the retry budget runs out
    async fn issue(&self, inner: &mut ChannelInner, characteristic: CharacteristicRef) {
        loop {
            let Some(live) = inner.attempt.as_ref() else {
                return;
            };
            let (id, payload) = (live.id, live.payload.clone());

            match self.transport.write(&characteristic, payload, id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("{} attempt {} not submitted: {}", self.parameter, id, e);
                    if !self.record_failure(inner) {
                        return;
                    }
                }
            }
        }
    }

    /// Count a failure against the live attempt; returns whether to write again
    fn record_failure(&self, inner: &mut ChannelInner) -> bool {
        let Some(live) = inner.attempt.as_mut() else {
            return false;
        };
        live.failures += 1;
        if live.failures < self.retry_limit && !live.cancelled {
            debug!(
                "{} attempt {} retry {}/{}",
                self.parameter, live.id, live.failures, self.retry_limit
            );
            return true;
        }

        let Some(abandoned) = inner.attempt.take() else {
            return false;
        };
        inner.state = ChannelState::Idle;

        if !abandoned.cancelled {
            warn!(
                "{} attempt {} abandoned after {} failed writes",
                self.parameter, abandoned.id, abandoned.failures
            );
            self.report(ChannelReport::Abandoned {
                parameter: self.parameter,
                value: abandoned.command.value(),
                failures: abandoned.failures,
                timestamp: SystemTime::now(),
            });
        }
        false
    }

    fn report(&self, report: ChannelReport) {
        if self.reports.send(SessionOutput::Report(report)).is_err() {
            debug!("{} report dropped, no listener", self.parameter);
        }
    }
}
