//! Routes protocol messages to steps.

use keyloom_crypto::Prng;
use keyloom_proto::{ProtocolMessage, ReceptionKind};
use tracing::{debug, info, warn};

use super::{Catalog, InstanceRecord, ProtocolRunner, StateId, StepContext, StepError};
use crate::{
    action::{EngineAction, Notification},
    config::EngineConfig,
    identity::OwnedIdentity,
    storage::Transaction,
};

/// Why a message was dropped without touching any instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No protocol with this id is registered
    UnknownProtocol,
    /// The instance already finished or was cancelled
    TerminalInstance,
    /// The body does not decode as the claimed message kind
    Undecodable,
    /// No step accepts this message in the instance's current state
    NoApplicableStep,
    /// The instance uid belongs to another protocol
    ProtocolMismatch,
}

/// Why an instance was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The message arrived through the wrong kind of channel
    UnexpectedReception {
        /// Kind the step requires
        expected: ReceptionKind,
        /// Kind the message came through
        actual: ReceptionKind,
    },
    /// A step detected a protocol violation
    Violation(String),
}

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A step ran and moved the instance
    Transitioned {
        /// State before the step
        from: StateId,
        /// State after the step
        to: StateId,
    },
    /// A step ran and left the instance where it was
    Unchanged,
    /// The message was dropped
    Discarded(DiscardReason),
    /// The instance is now cancelled
    Cancelled(CancelReason),
}

/// Outcome plus the effects to execute once the transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// What happened
    pub outcome: DispatchOutcome,
    /// Post-commit effects
    pub actions: Vec<EngineAction>,
}

impl Dispatch {
    fn discarded(reason: DiscardReason) -> Self {
        Self { outcome: DispatchOutcome::Discarded(reason), actions: Vec::new() }
    }
}

/// Protocol step dispatcher.
///
/// Stateless apart from the catalog and configuration it borrows. All
/// instance state is read from and written to the caller's transaction; the
/// caller commits.
pub struct Dispatcher<'c> {
    catalog: &'c Catalog,
    config: &'c EngineConfig,
}

impl<'c> Dispatcher<'c> {
    /// Dispatcher over a catalog.
    pub fn new(catalog: &'c Catalog, config: &'c EngineConfig) -> Self {
        Self { catalog, config }
    }

    /// Route `message` to its step and run it inside `txn`.
    ///
    /// Stale, unknown and undecodable messages are discarded, not errors.
    /// A wrong reception kind or a step violation cancels the instance and
    /// drops every write the step made.
    ///
    /// # Errors
    ///
    /// Collaborator failures inside the step (storage, channel, crypto,
    /// encoding). The caller must then drop `txn` uncommitted.
    pub fn dispatch(
        &self,
        txn: &mut Transaction<'_>,
        owned: &OwnedIdentity,
        prng: &mut dyn Prng,
        now: u64,
        message: &ProtocolMessage,
    ) -> Result<Dispatch, StepError> {
        let Some(runner) = self.catalog.runner(message.protocol) else {
            debug!(protocol = ?message.protocol, "discarding message for unknown protocol");
            return Ok(Dispatch::discarded(DiscardReason::UnknownProtocol));
        };

        let record = InstanceRecord::load(txn, &owned.identity, &message.instance_uid)?;
        if let Some(record) = &record {
            if record.protocol != message.protocol {
                debug!(
                    instance = ?message.instance_uid,
                    stored = ?record.protocol,
                    claimed = ?message.protocol,
                    "discarding message for instance of another protocol"
                );
                return Ok(Dispatch::discarded(DiscardReason::ProtocolMismatch));
            }
            if record.terminal {
                debug!(
                    protocol = runner.name(),
                    instance = ?message.instance_uid,
                    state = ?record.state_id,
                    "discarding message for terminal instance"
                );
                return Ok(Dispatch::discarded(DiscardReason::TerminalInstance));
            }
        }

        if !runner.decodes(message.kind, &message.body) {
            debug!(
                protocol = runner.name(),
                kind = ?message.kind,
                "discarding undecodable message"
            );
            return Ok(Dispatch::discarded(DiscardReason::Undecodable));
        }

        let from = record.as_ref().map_or(StateId::INITIAL, |record| record.state_id);
        let Some(step) = self.catalog.lookup(message.protocol, from, message.kind) else {
            debug!(
                protocol = runner.name(),
                instance = ?message.instance_uid,
                state = ?from,
                kind = ?message.kind,
                "no step for message"
            );
            return Ok(Dispatch::discarded(DiscardReason::NoApplicableStep));
        };

        let actual = message.reception.kind();
        if step.reception != actual {
            let reason = CancelReason::UnexpectedReception { expected: step.reception, actual };
            return self.cancel(txn, runner, owned, message, now, reason);
        }

        let checkpoint = txn.checkpoint();
        let mut ctx = StepContext::new(
            txn,
            prng,
            self.config,
            now,
            owned,
            message.protocol,
            message.instance_uid,
            message.reception,
        );
        let result = runner.run(
            step.index,
            record.as_ref().map(|record| record.state.as_slice()),
            message,
            &mut ctx,
        );
        let actions = ctx.into_actions();

        match result {
            Ok(Some(transition)) => {
                InstanceRecord {
                    owned_identity: owned.identity,
                    instance_uid: message.instance_uid,
                    protocol: message.protocol,
                    state_id: transition.state_id,
                    state: transition.state,
                    terminal: transition.terminal,
                    updated_at: now,
                }
                .save(txn)?;

                info!(
                    protocol = runner.name(),
                    instance = ?message.instance_uid,
                    from = ?from,
                    to = ?transition.state_id,
                    "protocol step"
                );
                Ok(Dispatch {
                    outcome: DispatchOutcome::Transitioned { from, to: transition.state_id },
                    actions,
                })
            },
            Ok(None) => Ok(Dispatch { outcome: DispatchOutcome::Unchanged, actions }),
            Err(StepError::NotApplicable) => {
                txn.rollback_to(checkpoint);
                debug!(
                    protocol = runner.name(),
                    instance = ?message.instance_uid,
                    "step did not apply"
                );
                Ok(Dispatch::discarded(DiscardReason::NoApplicableStep))
            },
            Err(StepError::Violation(reason)) => {
                txn.rollback_to(checkpoint);
                self.cancel(txn, runner, owned, message, now, CancelReason::Violation(reason))
            },
            Err(err) => Err(err),
        }
    }

    fn cancel(
        &self,
        txn: &mut Transaction<'_>,
        runner: &dyn ProtocolRunner,
        owned: &OwnedIdentity,
        message: &ProtocolMessage,
        now: u64,
        reason: CancelReason,
    ) -> Result<Dispatch, StepError> {
        warn!(
            protocol = runner.name(),
            instance = ?message.instance_uid,
            reason = ?reason,
            "cancelling protocol instance"
        );

        InstanceRecord {
            owned_identity: owned.identity,
            instance_uid: message.instance_uid,
            protocol: message.protocol,
            state_id: StateId::CANCELLED,
            state: runner.cancelled_state()?,
            terminal: true,
            updated_at: now,
        }
        .save(txn)?;

        let notification = Notification::InstanceCancelled {
            owned_identity: owned.identity,
            protocol: message.protocol,
            instance_uid: message.instance_uid,
            reason: reason.clone(),
        };
        Ok(Dispatch {
            outcome: DispatchOutcome::Cancelled(reason),
            actions: vec![EngineAction::Notify(notification)],
        })
    }
}
