//! Removal of output files nobody needs anymore.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::task::Task;
use crate::task::deps::DepNode;
use crate::{Set, Status};

/// Roles of the output files that may be removed once no consumer needs them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GcPolicy {
    pub exts: Vec<String>,
}

impl GcPolicy {
    pub fn new(exts: &[&str]) -> Self {
        GcPolicy {
            exts: exts.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl Task {
    /// Roles still needed by consumers that have not completed.
    fn exts_needed_by_consumers(&self) -> Set<String> {
        self.consumers
            .iter()
            .filter(|edge| edge.id != self.id)
            .filter(|edge| {
                edge.task
                    .upgrade()
                    .and_then(|task| task.try_get().map(|t| t.status() != Status::Ok))
                    .unwrap_or(false)
            })
            .flat_map(|edge| edge.exts.iter().cloned())
            .collect()
    }

    /// Called when the task completed. Removes temporary files, its own outputs that
    /// no pending consumer needs and the outputs of its producers that became useless.
    pub fn clean_output_files(&mut self) -> crate::Result<Vec<PathBuf>> {
        let Some(gc) = self.gc.clone() else {
            return Ok(Vec::new());
        };
        let dir = self.dir()?.clone();
        dir.tmpdir().clean()?;

        let needed = self.exts_needed_by_consumers();
        let exts: Vec<String> = gc
            .exts
            .iter()
            .filter(|ext| !needed.contains(*ext))
            .cloned()
            .collect();
        let mut removed = dir.outdir().remove_exts(&exts)?;

        for dep in &self.deps {
            let DepNode::Task(producer) = dep.node() else {
                continue;
            };
            let Some(producer) = producer.try_get() else {
                continue;
            };
            let Some(producer_dir) = producer.dir.as_ref() else {
                continue;
            };
            let mut needed = Set::new();
            for edge in producer.consumers.iter().filter(|edge| edge.id != self.id) {
                let pending = edge
                    .task
                    .upgrade()
                    .and_then(|task| task.try_get().map(|t| t.status() != Status::Ok))
                    .unwrap_or(false);
                if pending {
                    needed.extend(edge.exts.iter().cloned());
                }
            }
            let exts: Vec<String> = gc
                .exts
                .iter()
                .filter(|ext| !needed.contains(*ext))
                .cloned()
                .collect();
            removed.extend(producer_dir.outdir().remove_exts(&exts)?);
        }

        if !removed.is_empty() {
            self.history.info(format!(
                "Removed {} output files: {}",
                removed.len(),
                removed
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::GcPolicy;
    use crate::Status;
    use crate::task::deps::{Dependency, add_dependency};
    use crate::task::family::TaskFamily;
    use crate::tests::utils::{TestEnv, scf_input, touch};

    #[test]
    fn test_gc_keeps_files_of_pending_consumers() {
        let env = TestEnv::new();
        let scf = env.task("scf", TaskFamily::Scf, scf_input());
        let nscf1 = env.task("nscf1", TaskFamily::Nscf, scf_input());
        let nscf2 = env.task("nscf2", TaskFamily::Nscf, scf_input());
        for task in [&scf, &nscf1, &nscf2] {
            task.get_mut().gc = Some(GcPolicy::new(&["DEN", "WFK"]));
        }
        add_dependency(&nscf1, Dependency::on_task(&scf, &["DEN"])).unwrap();
        add_dependency(&nscf2, Dependency::on_task(&scf, &["DEN"])).unwrap();

        let outdir = scf.get().dir().unwrap().outdir().clone();
        touch(&outdir.path_in("out_DEN"));
        touch(&outdir.path_in("out_WFK"));
        touch(&outdir.path_in("out_GSR.nc"));
        let tmp = scf.get().dir().unwrap().tmpdir().path_in("tmp_junk");
        touch(&tmp);

        // scf completes: DEN is still needed by both consumers
        let removed = scf.get_mut().clean_output_files().unwrap();
        assert_eq!(removed, vec![outdir.path_in("out_WFK")]);
        assert!(!tmp.exists());
        assert!(outdir.path_in("out_DEN").exists());

        // nscf1 completes: nscf2 still needs DEN
        nscf1.get_mut().status = Status::Ok;
        nscf1.get_mut().clean_output_files().unwrap();
        assert!(outdir.path_in("out_DEN").exists());

        // last consumer completes
        nscf2.get_mut().status = Status::Ok;
        nscf2.get_mut().clean_output_files().unwrap();
        assert!(!outdir.path_in("out_DEN").exists());
        assert!(outdir.path_in("out_GSR.nc").exists());
    }

    #[test]
    fn test_no_policy() {
        let env = TestEnv::new();
        let task = env.task("t", TaskFamily::Scf, scf_input());
        touch(&task.get().dir().unwrap().outdir().path_in("out_DEN"));
        assert!(task.get_mut().clean_output_files().unwrap().is_empty());
    }
}
