//! Subscription Lifecycle Manager.
//!
//! A client onboarding a service type gets one subscription on the shared
//! topic, named `{client}-{serviceType}`, carrying exactly one rule named
//! `{serviceType}-filter`. Provisioning is idempotent: calling
//! [`SubscriptionManager::ensure_subscriptions`] again with a new
//! championship set only replaces the rule.
//!
//! Both operations return a per-service-type report instead of a single
//! flag, so a caller whose request failed halfway knows exactly which
//! service types to retry.

use crate::broker::{BrokerError, RuleSwap, SubscriptionAdmin, SubscriptionOptions, DEFAULT_RULE_NAME};
use crate::filter::{FilterRule, ServiceType};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// Rejected before any broker call.
    #[error("invalid subscription request: {0}")]
    Validation(String),

    /// Some service types were not provisioned.
    #[error("{} of {} service types not provisioned for {}", .0.remaining().len(), .0.outcomes.len(), .0.client)]
    Partial(ProvisionReport),
}

/// Lowercase the client name and replace spaces with dashes.
pub fn sanitize_client_name(client: &str) -> Result<String, SubscriptionError> {
    let name = client.trim().to_lowercase().replace(' ', "-");
    if name.is_empty() {
        return Err(SubscriptionError::Validation("client name must not be empty".to_string()));
    }
    Ok(name)
}

/// `{sanitizedClient}-{serviceType}`
pub fn subscription_name(sanitized_client: &str, service_type: &ServiceType) -> String {
    format!("{}-{}", sanitized_client, service_type.as_str())
}

/// Step at which provisioning a service type failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionStage {
    CreateSubscription,
    RemoveDefaultRule,
    InstallFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ProvisionStatus {
    /// The rule is in place.
    #[serde(rename_all = "camelCase")]
    Installed {
        /// The subscription did not exist before this call.
        created: bool,
        swap: RuleSwap,
        /// The service type was unknown and got the generic predicate.
        fallback: bool,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        stage: ProvisionStage,
        error: String,
        /// The broker was unreachable rather than refusing the command.
        transient: bool,
    },
    /// Not attempted because an earlier service type failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutcome {
    pub service_type: String,
    pub subscription: String,
    pub rule: String,
    pub filter: String,
    #[serde(flatten)]
    pub status: ProvisionStatus,
}

/// Per-service-type result of [`SubscriptionManager::ensure_subscriptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub client: String,
    pub outcomes: Vec<ProvisionOutcome>,
}

impl ProvisionReport {
    /// Subscriptions whose rule is installed, new or pre-existing.
    pub fn created(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ProvisionStatus::Installed { .. }))
            .map(|o| o.subscription.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.status, ProvisionStatus::Installed { .. }))
    }

    /// Service types to send again: failed and skipped ones.
    pub fn remaining(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.status, ProvisionStatus::Installed { .. }))
            .map(|o| o.service_type.clone())
            .collect()
    }

    /// True when the failure was the broker being unreachable.
    pub fn broker_unavailable(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, ProvisionStatus::Failed { transient: true, .. }))
    }

    pub fn into_result(self) -> Result<Vec<String>, SubscriptionError> {
        if self.is_complete() {
            Ok(self.created())
        } else {
            Err(SubscriptionError::Partial(self))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TeardownStatus {
    Deleted,
    /// Nothing to delete.
    Absent,
    #[serde(rename_all = "camelCase")]
    Failed { error: String, transient: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownOutcome {
    pub service_type: String,
    pub subscription: String,
    #[serde(flatten)]
    pub status: TeardownStatus,
}

/// Per-service-type result of [`SubscriptionManager::teardown_subscriptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub client: String,
    pub outcomes: Vec<TeardownOutcome>,
}

impl TeardownReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| !matches!(o.status, TeardownStatus::Failed { .. }))
    }

    pub fn failed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TeardownStatus::Failed { .. }))
            .map(|o| o.service_type.clone())
            .collect()
    }
}

fn parse_service_types(service_types: &[String]) -> Result<Vec<ServiceType>, SubscriptionError> {
    if service_types.is_empty() {
        return Err(SubscriptionError::Validation("at least one service type is required".to_string()));
    }
    let mut seen = BTreeSet::new();
    let mut parsed = Vec::new();
    for raw in service_types {
        let name = raw.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(SubscriptionError::Validation(format!("invalid service type {:?}", raw)));
        }
        if seen.insert(name.to_string()) {
            parsed.push(ServiceType::parse(name));
        }
    }
    Ok(parsed)
}

/// Creates, updates and removes a client's subscriptions on one topic.
#[derive(Clone)]
pub struct SubscriptionManager {
    admin: Arc<dyn SubscriptionAdmin>,
    topic: String,
    options: SubscriptionOptions,
}

impl SubscriptionManager {
    pub fn new(admin: Arc<dyn SubscriptionAdmin>, topic: impl Into<String>) -> Self {
        Self {
            admin,
            topic: topic.into(),
            options: SubscriptionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Provision one subscription per service type, filtered to `championship_ids`.
    ///
    /// Every input is validated and every rule derived before the broker is
    /// touched. Service types are then handled in order; the first failure
    /// stops the run and the rest are reported as skipped.
    pub async fn ensure_subscriptions(
        &self,
        client: &str,
        service_types: &[String],
        championship_ids: &[i64],
    ) -> Result<ProvisionReport, SubscriptionError> {
        let client = sanitize_client_name(client)?;
        let service_types = parse_service_types(service_types)?;
        if let Some(bad) = championship_ids.iter().find(|id| **id <= 0) {
            return Err(SubscriptionError::Validation(format!(
                "championship ids must be positive integers (got {})",
                bad
            )));
        }
        let ids: BTreeSet<i64> = championship_ids.iter().copied().collect();

        let mut planned = Vec::with_capacity(service_types.len());
        for service_type in service_types {
            let rule = FilterRule::for_service(&service_type, &ids)
                .map_err(|e| SubscriptionError::Validation(e.to_string()))?;
            planned.push((service_type, rule));
        }

        let mut outcomes = Vec::with_capacity(planned.len());
        let mut halted = false;
        for (service_type, rule) in planned {
            let subscription = subscription_name(&client, &service_type);
            let status = if halted {
                ProvisionStatus::Skipped
            } else {
                self.provision_one(&subscription, &service_type, &rule).await
            };

            match &status {
                ProvisionStatus::Installed { created, swap, fallback } => info!(
                    subscription = %subscription,
                    rule = %rule.name,
                    filter = %rule.expression(),
                    created = *created,
                    swap = ?swap,
                    fallback = *fallback,
                    "Subscription filter installed"
                ),
                ProvisionStatus::Failed { stage, error, .. } => {
                    warn!(subscription = %subscription, stage = ?stage, error = %error, "Subscription provisioning failed");
                    halted = true;
                }
                ProvisionStatus::Skipped => {}
            }

            outcomes.push(ProvisionOutcome {
                service_type: service_type.as_str().to_string(),
                subscription,
                rule: rule.name.clone(),
                filter: rule.expression(),
                status,
            });
        }

        Ok(ProvisionReport { client, outcomes })
    }

    async fn provision_one(
        &self,
        subscription: &str,
        service_type: &ServiceType,
        rule: &FilterRule,
    ) -> ProvisionStatus {
        let failed = |stage: ProvisionStage, e: BrokerError| ProvisionStatus::Failed {
            stage,
            transient: e.is_transient(),
            error: e.to_string(),
        };

        let created = match self.admin.subscription_exists(&self.topic, subscription).await {
            Ok(true) => false,
            Ok(false) => match self
                .admin
                .create_subscription(&self.topic, subscription, &self.options)
                .await
            {
                Ok(()) => true,
                // Lost a race with a concurrent provisioner; same end state.
                Err(BrokerError::AlreadyExists(_)) => false,
                Err(e) => return failed(ProvisionStage::CreateSubscription, e),
            },
            Err(e) => return failed(ProvisionStage::CreateSubscription, e),
        };

        match self.admin.rule_exists(&self.topic, subscription, DEFAULT_RULE_NAME).await {
            Ok(false) => {}
            Ok(true) => match self.admin.delete_rule(&self.topic, subscription, DEFAULT_RULE_NAME).await {
                Ok(()) | Err(BrokerError::NotFound(_)) => {}
                Err(e) => return failed(ProvisionStage::RemoveDefaultRule, e),
            },
            Err(e) => return failed(ProvisionStage::RemoveDefaultRule, e),
        }

        match self.admin.replace_rules(&self.topic, subscription, rule).await {
            Ok(swap) => ProvisionStatus::Installed {
                created,
                swap,
                fallback: !service_type.is_known(),
            },
            Err(e) => failed(ProvisionStage::InstallFilter, e),
        }
    }

    /// Delete the client's subscription for each service type.
    ///
    /// Missing subscriptions are reported [`TeardownStatus::Absent`]. A
    /// failure does not stop the remaining deletions.
    pub async fn teardown_subscriptions(
        &self,
        client: &str,
        service_types: &[String],
    ) -> Result<TeardownReport, SubscriptionError> {
        let client = sanitize_client_name(client)?;
        let service_types = parse_service_types(service_types)?;

        let mut outcomes = Vec::with_capacity(service_types.len());
        for service_type in service_types {
            let subscription = subscription_name(&client, &service_type);
            let status = self.teardown_one(&subscription).await;
            match &status {
                TeardownStatus::Deleted => info!(subscription = %subscription, "Subscription deleted"),
                TeardownStatus::Absent => info!(subscription = %subscription, "Subscription already absent"),
                TeardownStatus::Failed { error, .. } => {
                    warn!(subscription = %subscription, error = %error, "Subscription teardown failed")
                }
            }
            outcomes.push(TeardownOutcome {
                service_type: service_type.as_str().to_string(),
                subscription,
                status,
            });
        }

        Ok(TeardownReport { client, outcomes })
    }

    async fn teardown_one(&self, subscription: &str) -> TeardownStatus {
        let failed = |e: BrokerError| TeardownStatus::Failed {
            transient: e.is_transient(),
            error: e.to_string(),
        };
        match self.admin.subscription_exists(&self.topic, subscription).await {
            Ok(false) => TeardownStatus::Absent,
            Ok(true) => match self.admin.delete_subscription(&self.topic, subscription).await {
                Ok(()) => TeardownStatus::Deleted,
                Err(BrokerError::NotFound(_)) => TeardownStatus::Absent,
                Err(e) => failed(e),
            },
            Err(e) => failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeadLetter, InMemoryBroker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "championship-events";

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn manager(broker: &InMemoryBroker) -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(broker.clone()), TOPIC)
    }

    #[test]
    fn test_sanitize_client_name() {
        assert_eq!(sanitize_client_name("Acme FC").unwrap(), "acme-fc");
        assert_eq!(sanitize_client_name("  Real  Club ").unwrap(), "real--club");
        assert!(sanitize_client_name("   ").is_err());
    }

    #[tokio::test]
    async fn test_ensure_creates_named_subscription() {
        let broker = InMemoryBroker::new();
        let report = manager(&broker)
            .ensure_subscriptions("Acme FC", &types(&["coleta", "finalizacao"]), &[1, 2, 3])
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.created(), vec!["acme-fc-coleta", "acme-fc-finalizacao"]);

        let rules = broker.rules(TOPIC, "acme-fc-finalizacao");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "finalizacao-filter");
        assert_eq!(
            rules[0].expression(),
            "(idChampionship = 1 OR idChampionship = 2 OR idChampionship = 3) AND (eventType = 'ChampionshipData' OR eventType = 'SkillEvent') AND (idSkill IN (3, 8, 18))"
        );
    }

    #[tokio::test]
    async fn test_ensure_twice_keeps_one_rule_for_latest_set() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let first = manager
            .ensure_subscriptions("Acme FC", &types(&["coleta"]), &[1, 2, 3])
            .await
            .unwrap();
        let second = manager
            .ensure_subscriptions("Acme FC", &types(&["coleta"]), &[4, 5])
            .await
            .unwrap();

        assert!(matches!(first.outcomes[0].status, ProvisionStatus::Installed { created: true, .. }));
        assert!(matches!(
            second.outcomes[0].status,
            ProvisionStatus::Installed { created: false, swap: RuleSwap::Atomic, .. }
        ));

        let rules = broker.rules(TOPIC, "acme-fc-coleta");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].expression(),
            "(idChampionship = 4 OR idChampionship = 5) AND (eventType = 'ChampionshipData' OR eventType = 'SkillEvent')"
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        for _ in 0..3 {
            manager
                .ensure_subscriptions("Acme FC", &types(&["escalacao"]), &[7])
                .await
                .unwrap();
        }
        assert_eq!(broker.subscriptions(TOPIC), vec!["acme-fc-escalacao"]);
        assert_eq!(broker.rules(TOPIC, "acme-fc-escalacao").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_type_reports_fallback() {
        let broker = InMemoryBroker::new();
        let report = manager(&broker)
            .ensure_subscriptions("Acme FC", &types(&["scouting"]), &[1])
            .await
            .unwrap();

        assert!(matches!(report.outcomes[0].status, ProvisionStatus::Installed { fallback: true, .. }));
        assert_eq!(report.outcomes[0].filter, "(idChampionship = 1) AND eventType = 'ChampionshipData'");
    }

    #[tokio::test]
    async fn test_validation_happens_before_broker() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let empty_ids = manager.ensure_subscriptions("Acme FC", &types(&["coleta"]), &[]).await;
        assert!(matches!(empty_ids, Err(SubscriptionError::Validation(_))));

        let bad_id = manager.ensure_subscriptions("Acme FC", &types(&["coleta"]), &[1, 0]).await;
        assert!(matches!(bad_id, Err(SubscriptionError::Validation(_))));

        let no_types = manager.ensure_subscriptions("Acme FC", &[], &[1]).await;
        assert!(matches!(no_types, Err(SubscriptionError::Validation(_))));

        assert!(broker.subscriptions(TOPIC).is_empty());
    }

    /// Delegates to an in-memory broker, failing the n-th subscription creation.
    struct FlakyAdmin {
        inner: InMemoryBroker,
        fail_on_create: usize,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionAdmin for FlakyAdmin {
        async fn subscription_exists(&self, topic: &str, sub: &str) -> Result<bool, BrokerError> {
            self.inner.subscription_exists(topic, sub).await
        }

        async fn create_subscription(
            &self,
            topic: &str,
            sub: &str,
            options: &SubscriptionOptions,
        ) -> Result<(), BrokerError> {
            if self.creates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on_create {
                return Err(BrokerError::Unavailable("connection reset".into()));
            }
            self.inner.create_subscription(topic, sub, options).await
        }

        async fn delete_subscription(&self, topic: &str, sub: &str) -> Result<(), BrokerError> {
            self.inner.delete_subscription(topic, sub).await
        }

        async fn rule_names(&self, topic: &str, sub: &str) -> Result<Vec<String>, BrokerError> {
            self.inner.rule_names(topic, sub).await
        }

        async fn create_rule(&self, topic: &str, sub: &str, rule: &FilterRule) -> Result<(), BrokerError> {
            self.inner.create_rule(topic, sub, rule).await
        }

        async fn delete_rule(&self, topic: &str, sub: &str, name: &str) -> Result<(), BrokerError> {
            self.inner.delete_rule(topic, sub, name).await
        }

        async fn dead_letters(&self, topic: &str, sub: &str, limit: usize) -> Result<Vec<DeadLetter>, BrokerError> {
            self.inner.dead_letters(topic, sub, limit).await
        }

        async fn ping(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_partial_failure_reports_remainder() {
        let broker = InMemoryBroker::new();
        let admin = FlakyAdmin {
            inner: broker.clone(),
            fail_on_create: 2,
            creates: AtomicUsize::new(0),
        };
        let manager = SubscriptionManager::new(Arc::new(admin), TOPIC);

        let report = manager
            .ensure_subscriptions("Acme FC", &types(&["coleta", "finalizacao", "escalacao"]), &[1])
            .await
            .unwrap();

        assert!(!report.is_complete());
        assert!(report.broker_unavailable());
        assert_eq!(report.created(), vec!["acme-fc-coleta"]);
        assert_eq!(report.remaining(), vec!["finalizacao", "escalacao"]);
        assert!(matches!(
            report.outcomes[1].status,
            ProvisionStatus::Failed { stage: ProvisionStage::CreateSubscription, transient: true, .. }
        ));
        assert_eq!(report.outcomes[2].status, ProvisionStatus::Skipped);
        assert_eq!(broker.subscriptions(TOPIC), vec!["acme-fc-coleta"]);

        assert!(matches!(report.into_result(), Err(SubscriptionError::Partial(_))));
    }

    #[tokio::test]
    async fn test_default_rule_swap_is_sequential() {
        let broker = InMemoryBroker::new();
        let admin = FlakyAdmin {
            inner: broker.clone(),
            fail_on_create: usize::MAX,
            creates: AtomicUsize::new(0),
        };
        let report = SubscriptionManager::new(Arc::new(admin), TOPIC)
            .ensure_subscriptions("Acme FC", &types(&["coleta"]), &[1])
            .await
            .unwrap();

        assert!(matches!(
            report.outcomes[0].status,
            ProvisionStatus::Installed { swap: RuleSwap::Sequential, .. }
        ));
        assert_eq!(broker.rules(TOPIC, "acme-fc-coleta").len(), 1);
    }

    #[tokio::test]
    async fn test_teardown() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager
            .ensure_subscriptions("Acme FC", &types(&["coleta"]), &[1])
            .await
            .unwrap();

        let report = manager
            .teardown_subscriptions("Acme FC", &types(&["coleta", "escalacao"]))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.outcomes[0].status, TeardownStatus::Deleted);
        assert_eq!(report.outcomes[1].status, TeardownStatus::Absent);
        assert!(broker.subscriptions(TOPIC).is_empty());
    }

    #[test]
    fn test_report_serialization() {
        let report = ProvisionReport {
            client: "acme-fc".into(),
            outcomes: vec![ProvisionOutcome {
                service_type: "coleta".into(),
                subscription: "acme-fc-coleta".into(),
                rule: "coleta-filter".into(),
                filter: "1=1".into(),
                status: ProvisionStatus::Installed {
                    created: true,
                    swap: RuleSwap::Atomic,
                    fallback: false,
                },
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["status"], "installed");
        assert_eq!(json["outcomes"][0]["swap"], "atomic");
        assert_eq!(json["outcomes"][0]["serviceType"], "coleta");
    }
}
