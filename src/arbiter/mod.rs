use std::fmt;
use std::sync::Arc;

use serde_json::json;

use crate::config::{AppConfig, ArbiterConfig};
use crate::logging::{LogLevel, Logger};
use crate::storage::{PermissionDecision, StorageFacade};
use crate::wire::envelope::RequestEnvelope;

/// What the arbiter knows about the request besides the envelope itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecisionContext {
    /// The request is being re-driven from the store after a restart.
    pub restored: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { reason: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Persist this verdict for the sender and operation.
    pub remember: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            remember: false,
        }
    }

    pub fn deny(reason: Option<String>) -> Self {
        Self {
            verdict: Verdict::Deny { reason },
            remember: false,
        }
    }

    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allow)
    }

    fn from_permission(decision: PermissionDecision) -> Self {
        match decision {
            PermissionDecision::Allow => Self::allow(),
            PermissionDecision::Deny => Self::deny(Some("denied by remembered decision".to_owned())),
        }
    }

    fn as_permission(&self) -> PermissionDecision {
        match self.verdict {
            Verdict::Allow => PermissionDecision::Allow,
            Verdict::Deny { .. } => PermissionDecision::Deny,
        }
    }
}

/// Yes/no authority over requests. Implementations may block while a human decides.
pub trait Arbiter: Send + Sync {
    fn decide(&self, request: &RequestEnvelope, context: &DecisionContext) -> Decision;
}

#[derive(Debug)]
pub enum ArbiterError {
    UnknownDecision { field: String, raw: String },
    EmptyRuleSender { index: usize },
}

impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDecision { field, raw } => {
                write!(f, "{field} has unknown decision '{raw}' (expected allow or deny)")
            }
            Self::EmptyRuleSender { index } => {
                write!(f, "arbiter.rules[{index}].sender must not be empty")
            }
        }
    }
}

impl std::error::Error for ArbiterError {}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PolicyRule {
    sender: String,
    operation: Option<String>,
    decision: PermissionDecision,
}

impl PolicyRule {
    fn matches(&self, sender: &str, operation: &str) -> bool {
        (self.sender == "*" || self.sender == sender)
            && self
                .operation
                .as_deref()
                .map_or(true, |expected| expected == "*" || expected == operation)
    }
}

/// Static rules from configuration; the first matching rule wins, otherwise the default applies.
#[derive(Clone, Debug)]
pub struct PolicyArbiter {
    rules: Vec<PolicyRule>,
    default_decision: PermissionDecision,
}

impl PolicyArbiter {
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            default_decision: PermissionDecision::Allow,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            rules: Vec::new(),
            default_decision: PermissionDecision::Deny,
        }
    }

    pub fn from_config(config: &ArbiterConfig) -> Result<Self, ArbiterError> {
        let default_decision = PermissionDecision::parse(&config.default_decision).ok_or_else(|| {
            ArbiterError::UnknownDecision {
                field: "arbiter.default_decision".to_owned(),
                raw: config.default_decision.clone(),
            }
        })?;

        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                if rule.sender.trim().is_empty() {
                    return Err(ArbiterError::EmptyRuleSender { index });
                }
                let decision = PermissionDecision::parse(&rule.decision).ok_or_else(|| {
                    ArbiterError::UnknownDecision {
                        field: format!("arbiter.rules[{index}].decision"),
                        raw: rule.decision.clone(),
                    }
                })?;
                Ok(PolicyRule {
                    sender: rule.sender.clone(),
                    operation: rule.operation.clone(),
                    decision,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            default_decision,
        })
    }
}

impl Arbiter for PolicyArbiter {
    fn decide(&self, request: &RequestEnvelope, _context: &DecisionContext) -> Decision {
        let decision = self
            .rules
            .iter()
            .find(|rule| rule.matches(&request.sender_identity, request.operation()))
            .map(|rule| rule.decision)
            .unwrap_or(self.default_decision);

        match decision {
            PermissionDecision::Allow => Decision::allow(),
            PermissionDecision::Deny => Decision::deny(Some(format!(
                "'{}' may not perform '{}'",
                request.sender_identity,
                request.operation()
            ))),
        }
    }
}

/// Consults remembered per-app decisions before delegating, and stores verdicts flagged
/// `remember`.
pub struct RememberingArbiter {
    inner: Arc<dyn Arbiter>,
    storage: Arc<StorageFacade>,
    logger: Logger,
    persist: bool,
}

impl RememberingArbiter {
    pub fn new(
        inner: Arc<dyn Arbiter>,
        storage: Arc<StorageFacade>,
        logger: Logger,
        persist: bool,
    ) -> Self {
        Self {
            inner,
            storage,
            logger,
            persist,
        }
    }
}

impl Arbiter for RememberingArbiter {
    fn decide(&self, request: &RequestEnvelope, context: &DecisionContext) -> Decision {
        let sender = request.sender_identity.as_str();
        let operation = request.operation();

        match self.storage.get_permission(sender, operation) {
            Ok(Some(record)) => return Decision::from_permission(record.decision),
            Ok(None) => {}
            Err(err) => self.logger.log(
                LogLevel::Warn,
                Some("arbiter"),
                "Failed to read remembered decision; asking delegate",
                Some(json!({ "sender": sender, "operation": operation, "error": err.to_string() })),
            ),
        }

        let decision = self.inner.decide(request, context);
        if decision.remember && self.persist {
            if let Err(err) = self
                .storage
                .put_permission(sender, operation, decision.as_permission())
            {
                self.logger.log(
                    LogLevel::Warn,
                    Some("arbiter"),
                    "Failed to remember decision",
                    Some(json!({ "sender": sender, "operation": operation, "error": err.to_string() })),
                );
            }
        }
        decision
    }
}

/// Arbiter stack described by `[arbiter]`: config rules wrapped by remembered decisions.
pub fn arbiter_from_app_config(
    config: &AppConfig,
    storage: Arc<StorageFacade>,
    logger: Logger,
) -> Result<Arc<dyn Arbiter>, ArbiterError> {
    let policy = PolicyArbiter::from_config(&config.arbiter)?;
    Ok(Arc::new(RememberingArbiter::new(
        Arc::new(policy),
        storage,
        logger,
        config.arbiter.remember_decisions,
    )))
}
