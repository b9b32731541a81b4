use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Vars;
use crate::doc::find_doc;
use crate::resources::histogram::SparseHistogram;
use crate::resources::{
    Condition, MetaPriority, RankingField, RankingPriority, ResourceConfiguration,
    SelectionPolicy,
};

/// Tag of the document produced by the autoparal probe run.
pub const AUTOPARAL_TAG: &str = "Autoparal";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HintInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoparal: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ncpus: Option<u32>,
    /// Parallel algorithm used by the probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paral_kgb: Option<i64>,
    #[serde(flatten)]
    pub extra: Vars,
}

/// Configurations reported by the external program, together with the probe metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HintSet {
    info: HintInfo,
    #[serde(rename = "configurations")]
    confs: Vec<ResourceConfiguration>,
}

impl HintSet {
    pub fn new(info: HintInfo, confs: Vec<ResourceConfiguration>) -> Self {
        HintSet { info, confs }
    }

    /// Extracts the `!Autoparal` document from the program output.
    pub fn parse(text: &str) -> crate::Result<Self> {
        let doc = find_doc(text, AUTOPARAL_TAG).ok_or_else(|| {
            crate::Error::HintParseError(format!("cannot find the !{AUTOPARAL_TAG} document"))
        })?;
        doc.parse_body::<HintSet>()
            .map_err(|e| crate::Error::HintParseError(e.to_string()))
    }

    pub fn info(&self) -> &HintInfo {
        &self.info
    }

    pub fn confs(&self) -> &[ResourceConfiguration] {
        &self.confs
    }

    pub fn len(&self) -> usize {
        self.confs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confs.is_empty()
    }

    pub fn max_cores(&self) -> u32 {
        self.confs.iter().map(|c| c.num_cores()).max().unwrap_or(0)
    }

    pub fn max_speedup(&self) -> f64 {
        self.confs.iter().map(|c| c.speedup()).fold(0.0, f64::max)
    }

    pub fn max_efficiency(&self) -> f64 {
        self.confs.iter().map(|c| c.efficiency()).fold(0.0, f64::max)
    }

    pub fn max_mem_per_proc(&self) -> f64 {
        self.confs.iter().map(|c| c.mem_per_proc()).fold(0.0, f64::max)
    }

    /// Keeps the configurations matching `condition`. If nothing matches, the set is left
    /// untouched. Returns `true` if the filter was applied.
    pub fn select_with_condition(&mut self, condition: &Condition) -> bool {
        self.retain_or_revert(|conf| condition.evaluate(&conf.fields()), "condition")
    }

    /// Like [`select_with_condition`](Self::select_with_condition), evaluated over the
    /// extra variables of each configuration.
    pub fn select_with_vars_condition(&mut self, condition: &Condition) -> bool {
        self.retain_or_revert(|conf| condition.evaluate(conf.vars()), "vars_condition")
    }

    fn retain_or_revert<F: Fn(&ResourceConfiguration) -> bool>(
        &mut self,
        predicate: F,
        name: &str,
    ) -> bool {
        let selected: Vec<_> = self.confs.iter().filter(|c| predicate(c)).cloned().collect();
        if selected.is_empty() && !self.confs.is_empty() {
            log::warn!("Autoparal: {name} filter removed all configurations, ignoring it");
            return false;
        }
        self.confs = selected;
        true
    }

    pub fn sort_by_speedup(&mut self) {
        self.confs.sort_by(|a, b| b.speedup().total_cmp(&a.speedup()));
    }

    pub fn sort_by_efficiency(&mut self) {
        self.confs
            .sort_by(|a, b| b.efficiency().total_cmp(&a.efficiency()));
    }

    /// Ascending; a no-op when no configuration reports its memory.
    pub fn sort_by_mem_per_proc(&mut self) {
        if self.confs.iter().any(|c| c.mem_per_proc() > 0.0) {
            self.confs
                .sort_by(|a, b| a.mem_per_proc().total_cmp(&b.mem_per_proc()));
        }
    }

    fn sort_by_field(&mut self, field: RankingField) {
        match field {
            RankingField::Speedup => self.sort_by_speedup(),
            RankingField::Efficiency => self.sort_by_efficiency(),
            RankingField::MemPerProc => self.sort_by_mem_per_proc(),
        }
    }

    /// Narrows the configurations priority by priority, keeping at each step only the best
    /// bucket of a sparse histogram (highest for speedup/efficiency, lowest for memory).
    pub fn multidimensional_optimization(
        &self,
        priorities: &[RankingField],
    ) -> crate::Result<Vec<ResourceConfiguration>> {
        let mut confs = self.confs.clone();
        for priority in priorities {
            let key = |c: &ResourceConfiguration| match priority {
                RankingField::Speedup => c.speedup(),
                RankingField::Efficiency => c.efficiency(),
                RankingField::MemPerProc => c.mem_per_proc(),
            };
            let hist = SparseHistogram::new(&confs, key, priority.histogram_step());
            let best = match priority {
                RankingField::MemPerProc => hist.first(),
                _ => hist.last(),
            };
            confs = best.map(|c| c.to_vec()).unwrap_or_default();
            log::debug!("Priority {priority:?}: {} configurations left", confs.len());
        }
        if confs.is_empty() {
            return Err(crate::Error::SelectionError(
                "no configuration survived the optimization".to_string(),
            ));
        }
        Ok(confs)
    }

    /// Returns the configurations usable with at most `max_ncpus` cores, best first.
    pub fn get_ordered_with_policy(
        &self,
        policy: &SelectionPolicy,
        max_ncpus: u32,
    ) -> crate::Result<Vec<ResourceConfiguration>> {
        policy.validate()?;
        let mut hints = self.clone();
        hints.confs.retain(|c| c.num_cores() <= max_ncpus);

        if !policy.condition.is_empty() {
            hints.select_with_condition(&policy.condition);
        }
        if !policy.vars_condition.is_empty() {
            hints.select_with_vars_condition(&policy.vars_condition);
        }

        match policy.autoparal_priorities.as_slice() {
            [RankingPriority::Field(field)] => {
                hints.sort_by_field(*field);
                Ok(hints.confs)
            }
            [
                RankingPriority::Meta(MetaPriority::HighestSpeedupMinimumEfficiencyCutoff {
                    minimum_efficiency,
                }),
            ] => {
                let cutoff: Condition = serde_json::from_value(
                    serde_json::json!({"efficiency": {"$gte": minimum_efficiency}}),
                )?;
                hints.select_with_condition(&cutoff);
                hints.sort_by_speedup();
                Ok(hints.confs)
            }
            priorities => {
                let fields: Vec<RankingField> = priorities
                    .iter()
                    .filter_map(|p| match p {
                        RankingPriority::Field(field) => Some(*field),
                        RankingPriority::Meta(_) => None,
                    })
                    .collect();
                hints.multidimensional_optimization(&fields)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HintSet;
    use crate::resources::{
        MetaPriority, RankingField, RankingPriority, ResourceConfiguration, SelectionPolicy,
    };
    use serde_json::json;

    const OUTPUT: &str = r#"
 Autoparal section
--- !Autoparal
info:
    version: 1
    autoparal: 1
    max_ncpus: 8
    paral_kgb: 1
configurations:
    - tot_ncpus: 2
      mpi_ncpus: 2
      efficiency:  0.95
      mem_per_cpu: 100.0
      vars: {npimage: 1, nppert: 1, npkpt: 2}
    - tot_ncpus: 4
      mpi_ncpus: 4
      efficiency:  0.5
      mem_per_cpu: 50.0
      vars: {npimage: 1, nppert: 1, npkpt: 4}
    - tot_ncpus: 8
      mpi_ncpus: 4
      omp_ncpus: 2
      efficiency:  0.8
      mem_per_cpu: 50.0
      vars: {npimage: 1, nppert: 1, npkpt: 4}
...
"#;

    fn conf(mpi: u32, efficiency: f64, mem: f64) -> ResourceConfiguration {
        ResourceConfiguration::new(mpi, 1, mem, efficiency).unwrap()
    }

    fn hints(confs: Vec<ResourceConfiguration>) -> HintSet {
        HintSet::new(Default::default(), confs)
    }

    fn policy(priorities: Vec<RankingPriority>) -> SelectionPolicy {
        SelectionPolicy {
            autoparal_priorities: priorities,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_hints() {
        let hints = HintSet::parse(OUTPUT).unwrap();
        assert_eq!(hints.len(), 3);
        assert_eq!(hints.info().paral_kgb, Some(1));
        assert_eq!(hints.info().max_ncpus, Some(8));
        assert_eq!(hints.max_cores(), 8);
        assert_eq!(hints.confs()[2].omp_threads(), 2);
        assert_eq!(hints.confs()[0].vars()["npkpt"], json!(2));
    }

    #[test]
    fn test_parse_missing_doc() {
        assert!(HintSet::parse("nothing here").is_err());
        assert!(HintSet::parse("--- !Autoparal\ninfo: {}\n").is_err());
    }

    #[test]
    fn test_parse_invalid_conf() {
        let text = "--- !Autoparal\ninfo: {}\nconfigurations:\n  - {mpi_ncpus: 0, efficiency: 1.0}\n...\n";
        assert!(HintSet::parse(text).is_err());
    }

    #[test]
    fn test_sort_by_speedup() {
        let mut hints = hints(vec![conf(1, 1.0, 0.0), conf(1, 3.0, 0.0), conf(1, 2.0, 0.0)]);
        hints.sort_by_speedup();
        let speedups: Vec<f64> = hints.confs().iter().map(|c| c.speedup()).collect();
        assert_eq!(speedups, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_sort_by_mem_per_proc() {
        let mut hints = hints(vec![conf(1, 1.0, 500.0), conf(1, 1.0, 100.0), conf(1, 1.0, 300.0)]);
        hints.sort_by_mem_per_proc();
        let mems: Vec<f64> = hints.confs().iter().map(|c| c.mem_per_proc()).collect();
        assert_eq!(mems, vec![100.0, 300.0, 500.0]);
    }

    #[test]
    fn test_condition_reverts_when_empty() {
        let mut hints = HintSet::parse(OUTPUT).unwrap();
        let condition = serde_json::from_value(json!({"num_cores": {"$gt": 100}})).unwrap();
        assert!(!hints.select_with_condition(&condition));
        assert_eq!(hints.len(), 3);

        let condition = serde_json::from_value(json!({"npkpt": 7})).unwrap();
        assert!(!hints.select_with_vars_condition(&condition));
        assert_eq!(hints.len(), 3);

        let condition = serde_json::from_value(json!({"npkpt": 4})).unwrap();
        assert!(hints.select_with_vars_condition(&condition));
        assert_eq!(hints.len(), 2);
    }

    #[test]
    fn test_ordered_respects_ceiling() {
        let hints = HintSet::parse(OUTPUT).unwrap();
        let ordered = hints
            .get_ordered_with_policy(&SelectionPolicy::default(), 4)
            .unwrap();
        let cores: Vec<u32> = ordered.iter().map(|c| c.num_cores()).collect();
        assert_eq!(cores, vec![4, 2]);
    }

    #[test]
    fn test_ordered_by_efficiency() {
        let hints = HintSet::parse(OUTPUT).unwrap();
        let ordered = hints
            .get_ordered_with_policy(
                &policy(vec![RankingPriority::Field(RankingField::Efficiency)]),
                8,
            )
            .unwrap();
        let effs: Vec<f64> = ordered.iter().map(|c| c.efficiency()).collect();
        assert_eq!(effs, vec![0.95, 0.8, 0.5]);
    }

    #[test]
    fn test_efficiency_cutoff() {
        let hints = HintSet::parse(OUTPUT).unwrap();
        let ordered = hints
            .get_ordered_with_policy(
                &policy(vec![RankingPriority::Meta(
                    MetaPriority::HighestSpeedupMinimumEfficiencyCutoff {
                        minimum_efficiency: 0.7,
                    },
                )]),
                8,
            )
            .unwrap();
        let cores: Vec<u32> = ordered.iter().map(|c| c.num_cores()).collect();
        assert_eq!(cores, vec![8, 2]);
    }

    #[test]
    fn test_multidimensional() {
        let hints = hints(vec![
            conf(4, 1.0, 3000.0),
            conf(4, 1.0, 100.0),
            conf(1, 1.0, 50.0),
        ]);
        let ordered = hints
            .get_ordered_with_policy(
                &policy(vec![
                    RankingPriority::Field(RankingField::Speedup),
                    RankingPriority::Field(RankingField::MemPerProc),
                ]),
                8,
            )
            .unwrap();
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].num_cores(), 4);
        assert_eq!(ordered[0].mem_per_proc(), 100.0);
    }

    #[test]
    fn test_multidimensional_empty() {
        let hints = hints(vec![conf(4, 1.0, 0.0)]);
        let result = hints.get_ordered_with_policy(
            &policy(vec![
                RankingPriority::Field(RankingField::Speedup),
                RankingPriority::Field(RankingField::Efficiency),
            ]),
            2,
        );
        assert!(result.is_err());
    }
}
