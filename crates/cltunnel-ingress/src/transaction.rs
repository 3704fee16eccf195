//! Transaction coordinator for configuration mutations
//!
//! One [`TransactionCoordinator::execute`] call is one transaction:
//!
//! ```text
//! Idle → Snapshotted → Mutated → SchemaValidated → SemanticValidated → Registered → ServiceApplied → Committed
//!                                        (failure after persist) → RolledBack → Failed
//! ```
//!
//! - Failures up to and including the schema gate happen before anything is
//!   written and end in `Failed` directly.
//! - The document is persisted right after the schema gate because cloudflared
//!   validates the file on disk. From there on every failure restores the
//!   snapshot byte for byte.
//! - If the service restart was attempted, the service is restarted once more
//!   after the restore so it runs the restored file. That second restart is not
//!   retried; its failure is reported as a rollback failure.
//! - Removals never reach `Registered`: cloudflared cannot delete DNS routes,
//!   so a removed hostname keeps its route upstream.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::document::{self, IngressDocument, IngressRule, Snapshot};
use crate::error::{DocumentError, IngressError, RuleSetError};
use crate::external::{ExternalError, RouteRegistrar, SemanticValidator, ServiceSupervisor};

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Idle,
    Snapshotted,
    Mutated,
    SchemaValidated,
    SemanticValidated,
    Registered,
    ServiceApplied,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Snapshotted => "snapshotted",
            TransactionState::Mutated => "mutated",
            TransactionState::SchemaValidated => "schema-validated",
            TransactionState::SemanticValidated => "semantic-validated",
            TransactionState::Registered => "registered",
            TransactionState::ServiceApplied => "service-applied",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled-back",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A structural change to the rule set
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Add {
        rule: IngressRule,
        allow_overwrite: bool,
    },
    Remove {
        hostname: String,
    },
}

impl Mutation {
    pub fn add(rule: IngressRule, allow_overwrite: bool) -> Self {
        Self::Add {
            rule,
            allow_overwrite,
        }
    }

    pub fn remove(hostname: impl Into<String>) -> Self {
        Self::Remove {
            hostname: hostname.into(),
        }
    }

    /// Hostname that needs a DNS route once the change is accepted
    fn route_hostname(&self) -> Option<&str> {
        match self {
            Mutation::Add { rule, .. } => rule.hostname.as_deref(),
            Mutation::Remove { .. } => None,
        }
    }

    fn apply(&self, document: &IngressDocument) -> Result<IngressDocument, RuleSetError> {
        let rules = document.rules();
        let rules = match self {
            Mutation::Add {
                rule,
                allow_overwrite,
            } => rules.add(rule.clone(), *allow_overwrite)?,
            Mutation::Remove { hostname } => rules.remove(hostname)?,
        };
        Ok(document.with_rules(rules))
    }
}

/// What went wrong in a failed transaction
#[derive(Debug, Error)]
pub enum FailureCause {
    /// Reading or validating the current document
    #[error(transparent)]
    Load(#[from] IngressError),

    /// The mutated document could not be serialized or failed the schema gate
    #[error("Updated configuration is invalid: {0}")]
    Document(#[source] DocumentError),

    #[error(transparent)]
    RuleSet(#[from] RuleSetError),

    #[error("Failed to write {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ingress configuration rejected by cloudflared: {0}")]
    SemanticRejection(#[source] ExternalError),

    #[error("Failed to register DNS route for {hostname}: {source}")]
    RegistrationFailure {
        hostname: String,
        #[source]
        source: ExternalError,
    },

    #[error("Failed to restart the tunnel service: {0}")]
    ServiceApply(#[source] ExternalError),
}

/// Why restoring the previous state did not complete
#[derive(Debug, Error)]
pub enum RollbackFailure {
    #[error("could not restore {path:?}: {source}")]
    RestoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration was restored but restarting the service afterwards failed: {0}")]
    Reapply(#[source] ExternalError),
}

/// Result of the rollback attempt that follows a failure
#[derive(Debug)]
pub enum RollbackOutcome {
    /// Nothing had been written
    NotNeeded,
    Restored,
    /// Restored and the service restarted on the restored file
    RestoredAndReapplied,
    Failed(RollbackFailure),
}

impl RollbackOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RollbackOutcome::Failed(_))
    }
}

/// A failed transaction: the original cause plus what the rollback achieved
#[derive(Debug)]
pub struct TransactionError {
    /// The state the transaction was trying to reach
    pub failed_at: TransactionState,
    pub cause: FailureCause,
    pub rollback: RollbackOutcome,
    /// Every state the transaction went through, ending in `Failed`
    pub states: Vec<TransactionState>,
    /// Hostname whose DNS route was registered before the failure; rolling
    /// back the file does not remove it
    pub route_left_registered: Option<String>,
    config_path: PathBuf,
}

impl TransactionError {
    /// Whether restoring the previous state failed and a human must step in
    pub fn rollback_failed(&self) -> bool {
        self.rollback.is_failure()
    }

    pub fn rollback_failure(&self) -> Option<&RollbackFailure> {
        match &self.rollback {
            RollbackOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    fn fmt_rollback(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rollback {
            RollbackOutcome::NotNeeded => Ok(()),
            RollbackOutcome::Restored => write!(
                f,
                "\nConfiguration rolled back to its previous state: {}",
                self.config_path.display()
            ),
            RollbackOutcome::RestoredAndReapplied => write!(
                f,
                "\nConfiguration rolled back to its previous state and the service was restarted: {}",
                self.config_path.display()
            ),
            RollbackOutcome::Failed(failure) => write!(
                f,
                "\nROLLBACK FAILED: {}\nManual intervention required: {} may match neither the previous nor the intended configuration",
                failure,
                self.config_path.display()
            ),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        self.fmt_rollback(f)?;
        if let Some(hostname) = &self.route_left_registered {
            write!(
                f,
                "\nThe DNS route for {} is still registered; cloudflared cannot remove routes, delete it in the Cloudflare dashboard if it is not wanted",
                hostname
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Successful transaction
#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    /// The document as committed to disk
    pub document: IngressDocument,
    pub states: Vec<TransactionState>,
}

/// Applies mutations to the configuration file
pub struct TransactionCoordinator<'a> {
    config_path: PathBuf,
    validator: &'a dyn SemanticValidator,
    registrar: &'a dyn RouteRegistrar,
    supervisor: &'a dyn ServiceSupervisor,
}

impl<'a> TransactionCoordinator<'a> {
    pub fn new(
        config_path: impl Into<PathBuf>,
        validator: &'a dyn SemanticValidator,
        registrar: &'a dyn RouteRegistrar,
        supervisor: &'a dyn ServiceSupervisor,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            validator,
            registrar,
            supervisor,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Read and validate the current document without changing anything
    pub fn current(&self) -> Result<IngressDocument, IngressError> {
        document::load(&self.config_path).map(|(_, doc)| doc)
    }

    /// Run one transaction
    pub fn execute(&self, mutation: Mutation) -> Result<TransactionReceipt, TransactionError> {
        let mut tx = Transaction::new(self);
        match tx.run(&mutation) {
            Ok(document) => {
                tx.advance(TransactionState::Committed);
                info!(path = %self.config_path.display(), "Configuration committed");
                Ok(TransactionReceipt {
                    document,
                    states: tx.states,
                })
            }
            Err((failed_at, cause)) => Err(tx.fail(failed_at, cause)),
        }
    }
}

type StepError = (TransactionState, FailureCause);

/// Per-invocation transaction state
struct Transaction<'c, 'a> {
    coordinator: &'c TransactionCoordinator<'a>,
    states: Vec<TransactionState>,
    snapshot: Option<Snapshot>,
    persisted: bool,
    apply_attempted: bool,
    registered: Option<String>,
}

impl<'c, 'a> Transaction<'c, 'a> {
    fn new(coordinator: &'c TransactionCoordinator<'a>) -> Self {
        Self {
            coordinator,
            states: vec![TransactionState::Idle],
            snapshot: None,
            persisted: false,
            apply_attempted: false,
            registered: None,
        }
    }

    fn advance(&mut self, state: TransactionState) {
        debug!(%state, "Transaction state");
        self.states.push(state);
    }

    fn run(&mut self, mutation: &Mutation) -> Result<IngressDocument, StepError> {
        use TransactionState::*;

        let coordinator = self.coordinator;
        let path = coordinator.config_path.as_path();

        let snapshot = document::read(path).map_err(|e| (Snapshotted, FailureCause::Load(e)))?;
        let current = document::parse(snapshot.as_str())
            .map_err(|e| (Snapshotted, FailureCause::Load(IngressError::from(e))))?;
        self.snapshot = Some(snapshot);
        self.advance(Snapshotted);

        let updated = mutation
            .apply(&current)
            .map_err(|e| (Mutated, FailureCause::RuleSet(e)))?;
        let text = updated
            .to_yaml()
            .map_err(|e| (Mutated, FailureCause::Document(e)))?;
        self.advance(Mutated);

        let document =
            document::parse(&text).map_err(|e| (SchemaValidated, FailureCause::Document(e)))?;
        self.advance(SchemaValidated);

        // cloudflared validates the file on disk, so this write precedes the semantic gate
        self.persisted = true;
        document::write(path, &text).map_err(|source| {
            (
                SemanticValidated,
                FailureCause::Persist {
                    path: path.to_path_buf(),
                    source,
                },
            )
        })?;
        debug!(path = %path.display(), "Persisted updated configuration");

        coordinator
            .validator
            .check(path)
            .map_err(|e| (SemanticValidated, FailureCause::SemanticRejection(e)))?;
        self.advance(SemanticValidated);

        if let Some(hostname) = mutation.route_hostname() {
            coordinator
                .registrar
                .register_route(&document.tunnel, hostname)
                .map_err(|source| {
                    (
                        Registered,
                        FailureCause::RegistrationFailure {
                            hostname: hostname.to_string(),
                            source,
                        },
                    )
                })?;
            self.registered = Some(hostname.to_string());
            self.advance(Registered);
        }

        self.apply_attempted = true;
        coordinator
            .supervisor
            .restart()
            .map_err(|e| (ServiceApplied, FailureCause::ServiceApply(e)))?;
        self.advance(ServiceApplied);

        Ok(document)
    }

    fn fail(mut self, failed_at: TransactionState, cause: FailureCause) -> TransactionError {
        debug!(%failed_at, error = %cause, "Transaction failed");

        let rollback = if self.persisted {
            self.rollback()
        } else {
            RollbackOutcome::NotNeeded
        };

        let route_left_registered = self.registered.take();
        if let Some(hostname) = &route_left_registered {
            warn!(
                hostname = %hostname,
                "DNS route stays registered; cloudflared cannot remove routes"
            );
        }

        self.advance(TransactionState::Failed);
        TransactionError {
            failed_at,
            cause,
            rollback,
            states: self.states,
            route_left_registered,
            config_path: self.coordinator.config_path.clone(),
        }
    }

    fn rollback(&mut self) -> RollbackOutcome {
        let coordinator = self.coordinator;
        let path = coordinator.config_path.as_path();
        let Some(snapshot) = self.snapshot.take() else {
            return RollbackOutcome::NotNeeded;
        };

        warn!(path = %path.display(), "Rolling back configuration");
        if let Err(source) = snapshot.restore(path) {
            error!(path = %path.display(), error = %source, "Rollback write failed");
            return RollbackOutcome::Failed(RollbackFailure::RestoreWrite {
                path: path.to_path_buf(),
                source,
            });
        }
        self.advance(TransactionState::RolledBack);

        if !self.apply_attempted {
            info!("Configuration rolled back");
            return RollbackOutcome::Restored;
        }

        info!("Restarting service after rollback");
        match coordinator.supervisor.restart() {
            Ok(()) => RollbackOutcome::RestoredAndReapplied,
            Err(e) => {
                error!(error = %e, "Service restart after rollback failed");
                RollbackOutcome::Failed(RollbackFailure::Reapply(e))
            }
        }
    }
}
