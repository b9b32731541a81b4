use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resources::Condition;

/// How the winning (configuration, adapter) pair is chosen.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precedence {
    /// Iterate configurations in rank order and take the first adapter able to host one.
    #[serde(rename = "autoparal_conf")]
    AutoparalConf,
    /// Iterate adapters by priority and take the first one able to host any configuration.
    #[serde(rename = "qadapter")]
    QAdapter,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingField {
    Speedup,
    Efficiency,
    MemPerProc,
}

impl RankingField {
    /// Bucket width used by the multi-priority optimization.
    pub fn histogram_step(&self) -> f64 {
        match self {
            RankingField::Speedup => 1.0,
            RankingField::Efficiency => 0.1,
            RankingField::MemPerProc => 1024.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "meta_priority", rename_all = "snake_case", deny_unknown_fields)]
pub enum MetaPriority {
    HighestSpeedupMinimumEfficiencyCutoff {
        #[serde(default = "default_minimum_efficiency")]
        minimum_efficiency: f64,
    },
}

fn default_minimum_efficiency() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankingPriority {
    Field(RankingField),
    Meta(MetaPriority),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectionPolicy {
    /// 0 disables the autoparal negotiation.
    pub autoparal: u32,
    pub condition: Condition,
    pub vars_condition: Condition,
    pub precedence: Precedence,
    pub autoparal_priorities: Vec<RankingPriority>,
    pub frozen_timeout: Duration,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            autoparal: 1,
            condition: Condition::default(),
            vars_condition: Condition::default(),
            precedence: Precedence::AutoparalConf,
            autoparal_priorities: vec![RankingPriority::Field(RankingField::Speedup)],
            frozen_timeout: Duration::from_secs(3600),
        }
    }
}

impl SelectionPolicy {
    pub fn validate(&self) -> crate::Result<()> {
        if self.autoparal_priorities.is_empty() {
            return Err(crate::Error::SelectionError(
                "autoparal_priorities must not be empty".to_string(),
            ));
        }
        if self.autoparal_priorities.len() > 1
            && self
                .autoparal_priorities
                .iter()
                .any(|p| matches!(p, RankingPriority::Meta(_)))
        {
            return Err(crate::Error::SelectionError(
                "a meta priority cannot be combined with other priorities".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn autoparal_enabled(&self) -> bool {
        self.autoparal != 0
    }
}

#[cfg(test)]
mod tests {
    use super::{MetaPriority, Precedence, RankingField, RankingPriority, SelectionPolicy};

    #[test]
    fn test_parse_priorities() {
        let priorities: Vec<RankingPriority> = serde_yaml::from_str(
            "- speedup\n- mem_per_proc\n- {meta_priority: highest_speedup_minimum_efficiency_cutoff}\n",
        )
        .unwrap();
        assert_eq!(
            priorities,
            vec![
                RankingPriority::Field(RankingField::Speedup),
                RankingPriority::Field(RankingField::MemPerProc),
                RankingPriority::Meta(MetaPriority::HighestSpeedupMinimumEfficiencyCutoff {
                    minimum_efficiency: 1.0
                }),
            ]
        );
    }

    #[test]
    fn test_parse_precedence() {
        let p: Precedence = serde_yaml::from_str("qadapter").unwrap();
        assert_eq!(p, Precedence::QAdapter);
        assert!(serde_yaml::from_str::<Precedence>("foo").is_err());
    }

    #[test]
    fn test_validate() {
        let mut policy = SelectionPolicy::default();
        assert!(policy.validate().is_ok());
        policy.autoparal_priorities.clear();
        assert!(policy.validate().is_err());
        policy.autoparal_priorities = vec![
            RankingPriority::Field(RankingField::Speedup),
            RankingPriority::Meta(MetaPriority::HighestSpeedupMinimumEfficiencyCutoff {
                minimum_efficiency: 0.5,
            }),
        ];
        assert!(policy.validate().is_err());
    }
}
