use std::collections::HashMap;
use stone_config::FeedbackConfig;

use super::{FeedbackItem, PrioritizedFeedback, Priority, RoutedFeedback};

/// Area -> team table with a fallback team.
#[derive(Debug, Clone)]
pub struct TeamRouting {
    teams: HashMap<String, String>,
    default_team: String,
}

impl TeamRouting {
    pub fn new(teams: HashMap<String, String>, default_team: impl Into<String>) -> Self {
        Self {
            teams,
            default_team: default_team.into(),
        }
    }

    /// A `default` entry in the table wins over `defaultTeam`.
    #[must_use]
    pub fn from_config(config: &FeedbackConfig) -> Self {
        let default_team = config
            .teams
            .get("default")
            .cloned()
            .unwrap_or_else(|| config.default_team.clone());
        Self::new(config.teams.clone(), default_team)
    }

    #[must_use]
    pub fn team_for(&self, item: &FeedbackItem) -> &str {
        self.teams
            .get(item.affected_area.as_str())
            .unwrap_or(&self.default_team)
    }
}

/// Attach an owning team to every item, preserving order.
#[must_use]
pub fn route_feedback_to_teams(items: &[FeedbackItem], routing: &TeamRouting) -> Vec<RoutedFeedback> {
    items
        .iter()
        .map(|item| RoutedFeedback {
            item: item.clone(),
            team: routing.team_for(item).to_string(),
        })
        .collect()
}

/// Sort by severity, critical first. Ties keep input order.
#[must_use]
pub fn prioritize_feedback(items: &[FeedbackItem]) -> Vec<PrioritizedFeedback> {
    let mut prioritized: Vec<PrioritizedFeedback> = items
        .iter()
        .map(|item| PrioritizedFeedback {
            item: item.clone(),
            priority: Priority::from_severity(item.severity),
        })
        .collect();
    // sort_by_key is stable
    prioritized.sort_by_key(|p| p.item.severity.rank());
    prioritized
}
