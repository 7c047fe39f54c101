//! Filter Expression Builder.
//!
//! Translates a consumer's declared interest (a service type plus a set of
//! championship ids) into the boolean rule the broker evaluates against the
//! properties of every published message.
//!
//! Rules are built as a small expression tree ([`FilterExpr`]) so the same
//! value can be rendered to the broker's SQL-like text and evaluated locally
//! by the in-process and Redis brokers.
//!
//! ```text
//! service type      | category predicate
//! ------------------|--------------------------------------------------------
//! (unclassified)    | eventType = 'ChampionshipData'
//! coleta            | (eventType = 'ChampionshipData' OR eventType = 'SkillEvent')
//! finalizacao       | (... same as coleta ...) AND (idSkill IN (3, 8, 18))
//! periodo-partida   | eventType = 'GamePeriod'
//! escalacao         | eventType = 'Lineup'
//! finalizacao-xg    | eventType = 'xGEvent'
//! ```
//!
//! Final expression: `(idChampionship = a OR idChampionship = b ...) AND <category>`.

use crate::broker::{MessageProperties, PropertyValue};
use crate::event::{keys, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Skill ids forwarded to shot consumers: shot, goal, own goal.
pub const SHOT_SKILL_IDS: [i64; 3] = [3, 8, 18];

/// Errors raised while deriving a filter.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    /// The caller broke the builder's contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Known consumer service types.
///
/// Anything else is [`ServiceType::Unclassified`] and filtered with the
/// generic predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// `coleta`: raw collection feed.
    Collection,
    /// `finalizacao`: shots.
    Shots,
    /// `periodo-partida`: match period changes.
    MatchPeriod,
    /// `escalacao`: lineups.
    Lineup,
    /// `finalizacao-xg`: expected-goals shots.
    ExpectedGoals,
    /// Any other name; keeps the name for subscription and rule naming.
    Unclassified(String),
}

impl ServiceType {
    pub fn parse(name: &str) -> Self {
        match name {
            "coleta" => ServiceType::Collection,
            "finalizacao" => ServiceType::Shots,
            "periodo-partida" => ServiceType::MatchPeriod,
            "escalacao" => ServiceType::Lineup,
            "finalizacao-xg" => ServiceType::ExpectedGoals,
            other => ServiceType::Unclassified(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::Collection => "coleta",
            ServiceType::Shots => "finalizacao",
            ServiceType::MatchPeriod => "periodo-partida",
            ServiceType::Lineup => "escalacao",
            ServiceType::ExpectedGoals => "finalizacao-xg",
            ServiceType::Unclassified(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ServiceType::Unclassified(_))
    }

    /// Name of the rule installed for this service type.
    pub fn rule_name(&self) -> String {
        format!("{}-filter", self.as_str())
    }

    /// The conjunct narrowing a subscription to this service's event categories.
    pub fn category_predicate(&self) -> FilterExpr {
        match self {
            ServiceType::Collection => collection_kinds(),
            ServiceType::Shots => FilterExpr::and(vec![
                collection_kinds(),
                FilterExpr::is_in(
                    keys::ID_SKILL,
                    SHOT_SKILL_IDS.iter().map(|id| PropertyValue::Int(*id)).collect(),
                ),
            ]),
            ServiceType::MatchPeriod => FilterExpr::kind(EventKind::GamePeriod),
            ServiceType::Lineup => FilterExpr::kind(EventKind::Lineup),
            ServiceType::ExpectedGoals => FilterExpr::kind(EventKind::XgEvent),
            ServiceType::Unclassified(_) => FilterExpr::kind(EventKind::ChampionshipData),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn collection_kinds() -> FilterExpr {
    FilterExpr::or(vec![
        FilterExpr::kind(EventKind::ChampionshipData),
        FilterExpr::kind(EventKind::SkillEvent),
    ])
}

/// A boolean predicate over message properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FilterExpr {
    /// Matches every message (`1=1`).
    True,
    Eq { field: String, value: PropertyValue },
    In { field: String, values: Vec<PropertyValue> },
    Or { terms: Vec<FilterExpr> },
    And { terms: Vec<FilterExpr> },
}

impl FilterExpr {
    pub fn equals(field: &str, value: impl Into<PropertyValue>) -> Self {
        FilterExpr::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn is_in(field: &str, values: Vec<PropertyValue>) -> Self {
        FilterExpr::In {
            field: field.to_string(),
            values,
        }
    }

    pub fn or(terms: Vec<FilterExpr>) -> Self {
        FilterExpr::Or { terms }
    }

    pub fn and(terms: Vec<FilterExpr>) -> Self {
        // Flatten nested conjunctions so `(a) AND (b) AND (c)` renders flat.
        let mut flat = Vec::with_capacity(terms.len());
        for term in terms {
            match term {
                FilterExpr::And { terms } => flat.extend(terms),
                other => flat.push(other),
            }
        }
        FilterExpr::And { terms: flat }
    }

    fn kind(kind: EventKind) -> Self {
        FilterExpr::equals(keys::EVENT_TYPE, kind.as_str())
    }

    /// Evaluate against message properties.
    ///
    /// A missing property never matches, as with SQL `NULL` comparisons.
    pub fn matches(&self, properties: &MessageProperties) -> bool {
        match self {
            FilterExpr::True => true,
            FilterExpr::Eq { field, value } => properties.get(field) == Some(value),
            FilterExpr::In { field, values } => properties
                .get(field)
                .map(|actual| values.contains(actual))
                .unwrap_or(false),
            FilterExpr::Or { terms } => terms.iter().any(|t| t.matches(properties)),
            FilterExpr::And { terms } => terms.iter().all(|t| t.matches(properties)),
        }
    }

    fn is_compound(&self) -> bool {
        matches!(
            self,
            FilterExpr::Or { .. } | FilterExpr::And { .. } | FilterExpr::In { .. }
        )
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::True => f.write_str("1=1"),
            FilterExpr::Eq { field, value } => write!(f, "{} = {}", field, value),
            FilterExpr::In { field, values } => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN ({})", field, list.join(", "))
            }
            FilterExpr::Or { terms } => {
                let parts: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                f.write_str(&parts.join(" OR "))
            }
            FilterExpr::And { terms } => {
                let parts: Vec<String> = terms
                    .iter()
                    .map(|t| {
                        if t.is_compound() {
                            format!("({})", t)
                        } else {
                            t.to_string()
                        }
                    })
                    .collect();
                f.write_str(&parts.join(" AND "))
            }
        }
    }
}

/// A named predicate attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    pub filter: FilterExpr,
}

impl FilterRule {
    pub fn new(name: impl Into<String>, filter: FilterExpr) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }

    /// The catch-all rule a broker puts on a fresh subscription.
    pub fn catch_all() -> Self {
        Self::new(crate::broker::DEFAULT_RULE_NAME, FilterExpr::True)
    }

    /// Derive the rule for a service type and championship interest.
    pub fn for_service(
        service_type: &ServiceType,
        championship_ids: &BTreeSet<i64>,
    ) -> Result<Self, FilterError> {
        Ok(Self::new(
            service_type.rule_name(),
            build_filter(service_type, championship_ids)?,
        ))
    }

    /// The broker's textual form of the rule.
    pub fn expression(&self) -> String {
        self.filter.to_string()
    }

    pub fn matches(&self, properties: &MessageProperties) -> bool {
        self.filter.matches(properties)
    }
}

/// Build the filter tree for a service type and championship set.
///
/// Ids are rendered in ascending order, so the same input always yields the
/// same expression.
pub fn build_filter(
    service_type: &ServiceType,
    championship_ids: &BTreeSet<i64>,
) -> Result<FilterExpr, FilterError> {
    if championship_ids.is_empty() {
        return Err(FilterError::InvalidArgument(
            "at least one championship id is required".to_string(),
        ));
    }

    if !service_type.is_known() {
        warn!(
            service_type = %service_type,
            "Unknown service type, falling back to the generic ChampionshipData filter"
        );
    }

    let championships = FilterExpr::or(
        championship_ids
            .iter()
            .map(|id| FilterExpr::equals(keys::ID_CHAMPIONSHIP, *id))
            .collect(),
    );

    Ok(FilterExpr::and(vec![
        championships,
        service_type.category_predicate(),
    ]))
}

/// Build the broker's filter text for a service type name and championship set.
pub fn build(service_type: &str, championship_ids: &BTreeSet<i64>) -> Result<String, FilterError> {
    build_filter(&ServiceType::parse(service_type), championship_ids).map(|f| f.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[i64]) -> BTreeSet<i64> {
        values.iter().copied().collect()
    }

    fn props(championship: i64, skill: i64, kind: &str) -> MessageProperties {
        let mut props = MessageProperties::new();
        props.insert(keys::ID_CHAMPIONSHIP.into(), PropertyValue::Int(championship));
        props.insert(keys::ID_SKILL.into(), PropertyValue::Int(skill));
        props.insert(keys::EVENT_TYPE.into(), PropertyValue::from(kind));
        props
    }

    #[test]
    fn test_build_generic() {
        let expr = build("eventos", &ids(&[1, 2])).unwrap();
        assert_eq!(
            expr,
            "(idChampionship = 1 OR idChampionship = 2) AND eventType = 'ChampionshipData'"
        );
    }

    #[test]
    fn test_build_every_known_service_type() {
        let set = ids(&[7]);
        assert_eq!(
            build("coleta", &set).unwrap(),
            "(idChampionship = 7) AND (eventType = 'ChampionshipData' OR eventType = 'SkillEvent')"
        );
        assert_eq!(
            build("finalizacao", &set).unwrap(),
            "(idChampionship = 7) AND (eventType = 'ChampionshipData' OR eventType = 'SkillEvent') AND (idSkill IN (3, 8, 18))"
        );
        assert_eq!(
            build("periodo-partida", &set).unwrap(),
            "(idChampionship = 7) AND eventType = 'GamePeriod'"
        );
        assert_eq!(
            build("escalacao", &set).unwrap(),
            "(idChampionship = 7) AND eventType = 'Lineup'"
        );
        assert_eq!(
            build("finalizacao-xg", &set).unwrap(),
            "(idChampionship = 7) AND eventType = 'xGEvent'"
        );
    }

    #[test]
    fn test_one_disjunct_per_championship() {
        let set = ids(&[30, 10, 20, 40]);
        for name in ["coleta", "finalizacao", "periodo-partida", "escalacao", "finalizacao-xg"] {
            let expr = build(name, &set).unwrap();
            assert_eq!(expr.matches("idChampionship = ").count(), 4, "{}", name);
            assert!(expr.starts_with(
                "(idChampionship = 10 OR idChampionship = 20 OR idChampionship = 30 OR idChampionship = 40) AND "
            ));
            let category = ServiceType::parse(name).category_predicate();
            assert!(expr.contains(&category.to_string()));
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build("finalizacao", &ids(&[3, 1, 2])).unwrap();
        let b = build("finalizacao", &ids(&[2, 3, 1])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_championships_rejected() {
        let err = build("coleta", &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, FilterError::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_service_type_falls_back() {
        let service = ServiceType::parse("finalizacoes");
        assert!(!service.is_known());
        assert_eq!(service.rule_name(), "finalizacoes-filter");
        assert_eq!(
            service.category_predicate(),
            FilterExpr::equals(keys::EVENT_TYPE, "ChampionshipData")
        );
    }

    #[test]
    fn test_shots_filter_excludes_skill_four() {
        let filter = build_filter(&ServiceType::Shots, &ids(&[10])).unwrap();
        assert!(!filter.matches(&props(10, 4, "ChampionshipData")));
        assert!(filter.matches(&props(10, 8, "ChampionshipData")));
        assert!(filter.matches(&props(10, 3, "SkillEvent")));
        assert!(!filter.matches(&props(11, 8, "ChampionshipData")));
    }

    #[test]
    fn test_missing_property_never_matches() {
        let filter = build_filter(&ServiceType::Lineup, &ids(&[1])).unwrap();
        let mut partial = MessageProperties::new();
        partial.insert(keys::ID_CHAMPIONSHIP.into(), PropertyValue::Int(1));
        assert!(!filter.matches(&partial));
    }

    #[test]
    fn test_type_sensitive_comparison() {
        let filter = FilterExpr::equals(keys::ID_CHAMPIONSHIP, 10);
        let mut text = MessageProperties::new();
        text.insert(keys::ID_CHAMPIONSHIP.into(), PropertyValue::from("10"));
        assert!(!filter.matches(&text));
    }

    #[test]
    fn test_rule_serde_preserves_filter() {
        let rule = FilterRule::for_service(&ServiceType::Shots, &ids(&[1, 2])).unwrap();
        let json = serde_json::to_string(&rule).unwrap();
        let back: FilterRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expression(), rule.expression());
        assert_eq!(back.name, "finalizacao-filter");
    }

    #[test]
    fn test_catch_all() {
        let rule = FilterRule::catch_all();
        assert_eq!(rule.name, "$Default");
        assert_eq!(rule.expression(), "1=1");
        assert!(rule.matches(&MessageProperties::new()));
    }
}
